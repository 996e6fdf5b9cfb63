//
// String util methods
//

use std::fs;
use std::str::FromStr;

pub fn upcase_first(s: &str) -> String {
    let mut c = s.chars();
    match c.next() {
        None => String::new(),
        Some(f) => f.to_uppercase().collect::<String>() + c.as_str(),
    }
}

pub fn try_parse_string<S, T>(string: Option<S>) -> Option<T>
where
    S: AsRef<str>,
    T: FromStr,
{
    if let Some(Ok(value)) = string.map(|s| s.as_ref().parse::<T>()) {
        Some(value)
    } else {
        None
    }
}

//
// Env methods
//

use std::env;

pub fn get_env_str_value(key: &str) -> Option<String> {
    let key_file = format!("{key}_FILE");
    let value_from_env = env::var(key);
    let value_file = env::var(&key_file);

    match (value_from_env, value_file) {
        (Ok(_), Ok(_)) => panic!("You should not define both {key} and {key_file}!"),
        (Ok(v_env), Err(_)) => Some(v_env),
        (Err(_), Ok(v_file)) => match fs::read_to_string(v_file) {
            Ok(content) => Some(content.trim().to_string()),
            Err(e) => panic!("Failed to load {key}: {e:?}"),
        },
        _ => None,
    }
}

pub fn get_env<V>(key: &str) -> Option<V>
where
    V: FromStr,
{
    try_parse_string(get_env_str_value(key))
}

pub fn get_env_bool(key: &str) -> Option<bool> {
    const TRUE_VALUES: &[&str] = &["true", "t", "yes", "y", "1"];
    const FALSE_VALUES: &[&str] = &["false", "f", "no", "n", "0"];

    match get_env_str_value(key) {
        Some(val) if TRUE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(true),
        Some(val) if FALSE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(false),
        _ => None,
    }
}

//
// Misc methods
//

pub fn get_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn file_exists(path: &str) -> bool {
    std::path::Path::new(path).exists()
}

//
// Retry methods
//

use std::thread::sleep;
use std::time::Duration;

pub fn retry<F, T, E>(func: F, max_tries: u32) -> Result<T, E>
where
    F: Fn() -> Result<T, E>,
{
    let mut tries = 0;

    loop {
        match func() {
            ok @ Ok(_) => return ok,
            err @ Err(_) => {
                tries += 1;

                if tries >= max_tries {
                    return err;
                }

                sleep(Duration::from_millis(500));
            }
        }
    }
}

/// Like [`retry`], but logs a warning between attempts. Used by the lead
/// queue while it waits for a backend to come up at process start.
pub fn retry_db<F, T, E>(func: F, max_tries: u32) -> Result<T, E>
where
    F: Fn() -> Result<T, E>,
    E: std::fmt::Debug,
{
    let mut tries = 0;

    loop {
        match func() {
            ok @ Ok(_) => return ok,
            Err(e) => {
                tries += 1;

                if tries >= max_tries && max_tries > 0 {
                    return Err(e);
                }

                log::warn!(target: "dbcore", "Can't connect to database, retrying: {e:?}");

                sleep(Duration::from_millis(1_000));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upcase_first_handles_empty() {
        assert_eq!(upcase_first(""), "");
        assert_eq!(upcase_first("host"), "Host");
    }

    #[test]
    fn try_parse_string_parses_valid_input() {
        let parsed: Option<u16> = try_parse_string(Some("5432"));
        assert_eq!(parsed, Some(5432));
        let parsed: Option<u16> = try_parse_string(Some("not-a-number"));
        assert_eq!(parsed, None);
    }

    #[test]
    fn get_env_bool_recognizes_common_spellings() {
        std::env::set_var("DBCORE_TEST_BOOL_T", "yes");
        std::env::set_var("DBCORE_TEST_BOOL_F", "n");
        assert_eq!(get_env_bool("DBCORE_TEST_BOOL_T"), Some(true));
        assert_eq!(get_env_bool("DBCORE_TEST_BOOL_F"), Some(false));
        std::env::remove_var("DBCORE_TEST_BOOL_T");
        std::env::remove_var("DBCORE_TEST_BOOL_F");
    }
}
