//! Pages and scripts served under `/` and `/mupf`.

use crate::error::Result;
use crate::features::Features;
use crate::macros;

const MAIN_HTML: &str = include_str!("../static/main.html");
const CLOSED_HTML: &str = include_str!("../static/closed.html");
const BOOTSTRAP_JS: &str = include_str!("../static/bootstrap.js");
const CORE_JS: &str = include_str!("../static/core.js");

pub fn main_page(charset: &str) -> String {
    MAIN_HTML.replace("{{charset}}", charset)
}

pub fn closed_page(charset: &str) -> String {
    CLOSED_HTML.replace("{{charset}}", charset)
}

/// The bootstrap script bound to session `cid`.
pub fn bootstrap(cid: &str) -> String {
    let mut quoted = String::with_capacity(cid.len() + 2);
    enhjson::write_str(&mut quoted, cid);
    BOOTSTRAP_JS.replace("\"{{cid}}\"", &quoted)
}

/// The core script preprocessed for `features`, ending with the feature table.
pub fn core(features: &Features) -> Result<String> {
    let mut script = macros::expand(CORE_JS, features)?;
    script.push_str("\nObject.assign(mupf.fts, ");
    script.push_str(&features.to_json());
    script.push_str(");\n");
    Ok(script)
}
