//! Rewrite a Dataverse dataset landing page URL into a clone-able
//! `annex::` URL wired to this remote. Pure string transformation used by
//! sibling registration; nothing at runtime depends on it.

use regex::Regex;

/// Matches `https://<instance>/dataset.xhtml?persistentId=doi:<suffix>`.
const LANDING_PAGE_PATTERN: &str =
    r"^(https?://.+)/dataset\.xhtml\?persistentId=(doi:[^&]+)(.*)$";

/// Rewrite a landing page URL, or return `None` when it is not one.
pub fn clone_url_from_landing_page(url: &str) -> Option<String> {
    let re = Regex::new(LANDING_PAGE_PATTERN).expect("static regex");
    let caps = re.captures(url)?;
    Some(format!(
        "annex::?type=external&externaltype=dataverse&url={}&doi={}&encryption=none",
        &caps[1], &caps[2]
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
