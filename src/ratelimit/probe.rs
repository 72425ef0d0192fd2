//! Paths only vulnerability scanners ask for.

const PROBE_SEGMENTS: &[&str] = &[
    ".env",
    ".git",
    ".svn",
    ".htaccess",
    ".ds_store",
    "wp-admin",
    "wp-login.php",
    "wp-content",
    "wp-includes",
    "xmlrpc.php",
    "phpmyadmin",
    "pma",
    "cgi-bin",
    "vendor",
    "phpinfo.php",
    "server-status",
    "actuator",
    "config.php",
];

/// True when any path segment matches a known scanner target.
#[must_use]
pub fn is_scanner_probe(path: &str) -> bool {
    path.split('/')
        .filter(|segment| !segment.is_empty())
        .any(|segment| {
            let segment = segment.to_ascii_lowercase();
            PROBE_SEGMENTS.contains(&segment.as_str())
                || segment.starts_with(".env.")
                || segment.ends_with(".php")
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_probes_match() {
        for path in [
            "/.env",
            "/.env.production",
            "/app/.git/config",
            "/wp-admin/install.php",
            "/wp-login.php",
            "/phpMyAdmin/",
            "/index.php",
        ] {
            assert!(is_scanner_probe(path), "{path} should be a probe");
        }
    }

    #[test]
    fn api_paths_do_not_match() {
        for path in ["/", "/health", "/v1/auth/login", "/v1/admin/ip-rules", "/environment"] {
            assert!(!is_scanner_probe(path), "{path} should not be a probe");
        }
    }
}
