//! Host-path translation for volume mounts (spec §4.9): when running inside
//! WSL, Windows-style paths are rewritten to their `/mnt/<drive>` mount
//! point; native Linux/macOS hosts pass paths through unchanged.

use std::sync::OnceLock;

static IS_WSL: OnceLock<bool> = OnceLock::new();

fn is_wsl() -> bool {
    *IS_WSL.get_or_init(|| {
        std::fs::read_to_string("/proc/version")
            .map(|v| v.to_ascii_lowercase().contains("microsoft"))
            .unwrap_or(false)
    })
}

pub fn translate_host_path(path: &str) -> String {
    if !is_wsl() {
        return path.to_string();
    }
    translate_windows_path(path)
}

fn translate_windows_path(path: &str) -> String {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        let drive = (bytes[0] as char).to_ascii_lowercase();
        let rest = &path[2..].replace('\\', "/");
        format!("/mnt/{}{}", drive, rest)
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_drive_letter_paths() {
        assert_eq!(translate_windows_path(r"C:\Users\dev\project"), "/mnt/c/Users/dev/project");
    }

    #[test]
    fn leaves_non_windows_paths_unchanged() {
        assert_eq!(translate_windows_path("/home/dev/project"), "/home/dev/project");
    }
}
