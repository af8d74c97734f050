use std::fs;
use std::path::PathBuf;

/// Pairing parameters carried by the out-of-band channel, e.g. the
/// fragment of a share link: `room=Baby&token=<base64url>`. Short aliases
/// (`r`, `psk`, `t`) are accepted for hand-typed links.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentParams {
    pub room: Option<String>,
    pub token: Option<String>,
}

impl FragmentParams {
    pub fn parse(fragment: &str) -> Self {
        let trimmed = fragment.trim().trim_start_matches('#');
        let mut params = FragmentParams::default();
        for (key, value) in url::form_urlencoded::parse(trimmed.as_bytes()) {
            match key.as_ref() {
                "room" | "r" if params.room.is_none() => {
                    params.room = Some(value.into_owned());
                }
                "token" | "psk" | "t" if params.token.is_none() => {
                    params.token = Some(value.into_owned());
                }
                _ => {}
            }
        }
        params
    }

    pub fn is_empty(&self) -> bool {
        self.room.is_none() && self.token.is_none()
    }
}

/// One-time channel the pairing token arrives on. `scrub` must make a
/// later `read` come back empty, even across process restarts.
pub trait ImportChannel {
    fn read(&self) -> Option<FragmentParams>;
    fn scrub(&mut self);
}

/// A pairing fragment dropped into a file, e.g. by a QR scanner or a
/// "paste share link" flow. Scrubbing deletes the file, so a restart
/// cannot re-import the same token.
pub struct FileImportChannel {
    path: PathBuf,
}

impl FileImportChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ImportChannel for FileImportChannel {
    fn read(&self) -> Option<FragmentParams> {
        let contents = fs::read_to_string(&self.path).ok()?;
        let params = FragmentParams::parse(&contents);
        if params.is_empty() { None } else { Some(params) }
    }

    fn scrub(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    target: "psk",
                    path = %self.path.display(),
                    error = %err,
                    "failed to scrub pairing file"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_and_alias_names() {
        let params = FragmentParams::parse("#room=Baby&token=abc123");
        assert_eq!(params.room.as_deref(), Some("Baby"));
        assert_eq!(params.token.as_deref(), Some("abc123"));

        let params = FragmentParams::parse("r=Den&psk=xyz");
        assert_eq!(params.room.as_deref(), Some("Den"));
        assert_eq!(params.token.as_deref(), Some("xyz"));

        let params = FragmentParams::parse("t=short");
        assert_eq!(params.room, None);
        assert_eq!(params.token.as_deref(), Some("short"));
    }

    #[test]
    fn empty_fragment_parses_empty() {
        assert!(FragmentParams::parse("").is_empty());
        assert!(FragmentParams::parse("#").is_empty());
    }
}
