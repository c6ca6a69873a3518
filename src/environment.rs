//! Child environment construction.

use std::collections::BTreeMap;
use std::env;
use std::ffi::{OsStr, OsString};

const LOCALE_KEYS: [&str; 2] = ["LC_ALL", "LANG"];
const DEFAULT_LOCALE: &str = "C";

/// Build the `KEY=VALUE` list handed to the child.
///
/// When `merge` is set the parent's variables are inherited, except the
/// locale variables and any key that `overrides` replaces. Overrides follow
/// in key order. `LC_ALL` and `LANG` default to `C` unless overridden.
pub fn build_environment(overrides: Option<&BTreeMap<String, String>>, merge: bool) -> Vec<OsString> {
    let inherited = if merge { Some(env::vars_os()) } else { None };
    build_from(inherited.into_iter().flatten(), overrides)
}

fn build_from<I>(inherited: I, overrides: Option<&BTreeMap<String, String>>) -> Vec<OsString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let overridden = |key: &str| overrides.is_some_and(|o| o.contains_key(key));
    let mut result: Vec<OsString> = inherited
        .into_iter()
        .filter(|(key, _)| {
            let key = key.to_string_lossy();
            !LOCALE_KEYS.iter().any(|locale| *locale == key) && !overridden(&*key)
        })
        .map(|(key, value)| entry(key, &value))
        .collect();

    if let Some(overrides) = overrides {
        result.extend(overrides.iter().map(|(key, value)| entry(key.into(), OsStr::new(value))));
    }
    for key in LOCALE_KEYS {
        if !overridden(key) {
            result.push(entry(key.into(), OsStr::new(DEFAULT_LOCALE)));
        }
    }
    result
}

fn entry(mut key: OsString, value: &OsStr) -> OsString {
    key.push("=");
    key.push(value);
    key
}
