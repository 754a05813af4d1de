//! Where kmsprobe reads its config and writes its logs.
//!
//! Only absolute XDG or `HOME` based directories are used. When neither is
//! available there is no user directory at all.

use std::ffi::OsString;
use std::path::PathBuf;

/// System-wide config, read when the user has none.
pub const SYSTEM_CONFIG: &str = "/etc/kmsprobe/config.toml";

const CONFIG_FILE: &str = "config.toml";

/// `$XDG_CONFIG_HOME`, else `$HOME/.config`.
pub fn config_dir() -> Option<PathBuf> {
    base_dir(
        std::env::var_os("XDG_CONFIG_HOME"),
        std::env::var_os("HOME"),
        &[".config"],
    )
}

/// `$XDG_DATA_HOME`, else `$HOME/.local/share`.
pub fn data_dir() -> Option<PathBuf> {
    base_dir(
        std::env::var_os("XDG_DATA_HOME"),
        std::env::var_os("HOME"),
        &[".local", "share"],
    )
}

pub fn kmsprobe_config_dir() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join("kmsprobe"))
}

pub fn kmsprobe_data_dir() -> Option<PathBuf> {
    data_dir().map(|dir| dir.join("kmsprobe"))
}

pub fn kmsprobe_log_dir() -> Option<PathBuf> {
    kmsprobe_data_dir().map(|dir| dir.join("logs"))
}

/// Config files to try, in order: the user's, then [`SYSTEM_CONFIG`].
pub fn config_search_path() -> Vec<PathBuf> {
    search_path(kmsprobe_config_dir())
}

fn search_path(user_dir: Option<PathBuf>) -> Vec<PathBuf> {
    user_dir
        .map(|dir| dir.join(CONFIG_FILE))
        .into_iter()
        .chain(std::iter::once(PathBuf::from(SYSTEM_CONFIG)))
        .collect()
}

fn base_dir(xdg: Option<OsString>, home: Option<OsString>, under_home: &[&str]) -> Option<PathBuf> {
    if let Some(dir) = absolute(xdg) {
        return Some(dir);
    }
    let mut dir = absolute(home)?;
    dir.extend(under_home);
    Some(dir)
}

fn absolute(value: Option<OsString>) -> Option<PathBuf> {
    value.map(PathBuf::from).filter(|path| path.is_absolute())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(s: &str) -> Option<OsString> {
        Some(OsString::from(s))
    }

    #[test]
    fn xdg_wins_over_home() {
        assert_eq!(
            base_dir(os("/xdg/config"), os("/home/user"), &[".config"]),
            Some(PathBuf::from("/xdg/config"))
        );
        assert_eq!(
            base_dir(None, os("/home/user"), &[".local", "share"]),
            Some(PathBuf::from("/home/user/.local/share"))
        );
    }

    #[test]
    fn empty_and_relative_values_are_ignored() {
        assert_eq!(
            base_dir(os(""), os("/home/user"), &[".config"]),
            Some(PathBuf::from("/home/user/.config"))
        );
        assert_eq!(
            base_dir(os("relative/config"), os("/home/user"), &[".config"]),
            Some(PathBuf::from("/home/user/.config"))
        );
        assert_eq!(base_dir(os(""), os("home"), &[".config"]), None);
    }

    #[test]
    fn no_user_dir_without_environment() {
        assert_eq!(base_dir(None, None, &[".config"]), None);
        assert_eq!(search_path(None), vec![PathBuf::from(SYSTEM_CONFIG)]);
    }

    #[test]
    fn user_config_comes_first() {
        let paths = search_path(Some(PathBuf::from("/home/user/.config/kmsprobe")));
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/home/user/.config/kmsprobe/config.toml"),
                PathBuf::from(SYSTEM_CONFIG),
            ]
        );
    }
}
