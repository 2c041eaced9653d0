//! Fixed facts about the Xcel Energy portal: where things live and what the
//! pages call them. Hosts are overridable so a run can target a mock portal.

use url::Url;

pub const DEFAULT_ACCOUNT_BASE: &str = "https://my.xcelenergy.com";
pub const DEFAULT_APP_BASE: &str = "https://myenergy.xcelenergy.com";

const LOGIN_PATH: &str = "/MyAccount/XE_Login?template=XE_MA_Template&gig_client_id=JnU2RjC15thihnMDrOyzKzvH";
const SSO_PATH: &str = "/MyAccount/idp/login?app=0sp2R0000008OoM";
const USAGE_HISTORY_PATH: &str = "/myenergy/usage-history";
const BILL_HISTORY_PATH: &str = "/myenergy/bill-presentment";

/// Substring of the login page URL; still seeing it means the login did not go through.
pub const LOGIN_PAGE_MARKER: &str = "XE_Login";

/// The Gigya screen-set keeps template copies of every field next to the
/// live one; only the `instance` role is the real control.
pub const LOGIN_ID_INPUT: &str = "input[data-screenset-roles='instance'][data-gigya-name='loginID']";
pub const PASSWORD_INPUT: &str = "input[data-screenset-roles='instance'][data-gigya-name='password']";
pub const SUBMIT_INPUT: &str = "input[data-screenset-roles='instance'][type='submit']";

pub const TIME_PERIOD_SELECT: &str = "select#timePeriod";
pub const METER_SELECT: &str = "select";
pub const EXPORT_BUTTON: &str = "button#downloadIntervalData";

pub const USAGE_AJAX_FRAGMENT: &str = "usage-history-ajax/format/json";
pub const BILL_AJAX_FRAGMENT: &str = "bill-presentment-account-summary-ajax";
pub const ON_DEMAND_AJAX_FRAGMENT: &str = "odr-ajax";
/// Cost bar chart widget on the bill history page.
pub const BILL_WIDGET_ID: &str = "4907";

/// Cookies SimpleSAML and the application set once the assertion is consumed.
pub const REQUIRED_SESSION_COOKIES: [&str; 2] = ["PHPSESSID", "SimpleSAMLSessionID"];

#[derive(Debug, Clone)]
pub struct PortalUrls {
    pub account_base: Url,
    pub app_base: Url,
}

impl PortalUrls {
    pub fn new(account_base: Url, app_base: Url) -> Self {
        Self { account_base, app_base }
    }

    pub fn login(&self) -> String {
        join(&self.account_base, LOGIN_PATH)
    }

    pub fn sso(&self) -> String {
        join(&self.account_base, SSO_PATH)
    }

    pub fn usage_history(&self) -> String {
        join(&self.app_base, USAGE_HISTORY_PATH)
    }

    pub fn bill_history(&self) -> String {
        join(&self.app_base, BILL_HISTORY_PATH)
    }

    pub fn app_host(&self) -> &str {
        self.app_base.host_str().unwrap_or_default()
    }

    /// Both hosts whose cookies make up the session.
    pub fn cookie_urls(&self) -> Vec<String> {
        vec![
            self.account_base.as_str().to_string(),
            self.app_base.as_str().to_string(),
        ]
    }
}

fn join(base: &Url, path_and_query: &str) -> String {
    format!("{}{}", base.as_str().trim_end_matches('/'), path_and_query)
}
