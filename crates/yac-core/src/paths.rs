//! Well-known filesystem locations.

use std::env;
use std::path::PathBuf;

/// Name of the per-user state directory under the home directory.
pub const STATE_DIR_NAME: &str = ".yac";

/// Resolve the home directory through `lookup`: `HOME` first, then
/// `USERPROFILE`. Empty values are ignored.
pub fn home_dir_with<F>(lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    ["HOME", "USERPROFILE"]
        .into_iter()
        .filter_map(|key| lookup(key))
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// The user's home directory from the process environment.
pub fn home_dir() -> Option<PathBuf> {
    home_dir_with(|key| env::var(key).ok())
}

/// `~/.yac`
pub fn state_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(STATE_DIR_NAME))
}

/// `~/.yac/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    state_dir().map(|dir| dir.join("config.json"))
}

/// `~/.yac/traces`, where wire traces go when enabled.
pub fn default_trace_dir() -> Option<PathBuf> {
    state_dir().map(|dir| dir.join("traces"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn lookup<'a>(vars: &'a HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| vars.get(key).map(|v| v.to_string())
    }

    #[test]
    fn prefers_home() {
        let vars = HashMap::from([("HOME", "/tmp/home"), ("USERPROFILE", "/tmp/profile")]);
        assert_eq!(home_dir_with(lookup(&vars)), Some(PathBuf::from("/tmp/home")));
    }

    #[test]
    fn falls_back_to_userprofile() {
        let vars = HashMap::from([("HOME", ""), ("USERPROFILE", "/tmp/profile")]);
        assert_eq!(
            home_dir_with(lookup(&vars)),
            Some(PathBuf::from("/tmp/profile"))
        );
    }

    #[test]
    fn none_when_unset() {
        let vars = HashMap::new();
        assert_eq!(home_dir_with(lookup(&vars)), None);
    }

    #[test]
    fn config_path_lives_under_state_dir() {
        let _guard = ENV_LOCK.lock().unwrap();
        let prev = env::var("HOME").ok();
        env::set_var("HOME", "/tmp/yac-home");

        assert_eq!(
            default_config_path(),
            Some(PathBuf::from("/tmp/yac-home/.yac/config.json"))
        );
        assert_eq!(
            default_trace_dir(),
            Some(PathBuf::from("/tmp/yac-home/.yac/traces"))
        );

        match prev {
            Some(value) => env::set_var("HOME", value),
            None => env::remove_var("HOME"),
        }
    }
}
