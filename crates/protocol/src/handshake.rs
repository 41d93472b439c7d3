use crate::ProtocolError;
use crate::constants::CODE_PREFIX;

/// File description sent by the uploader right after the upgrade.
///
/// Travels as exactly three text frames; absent values are sent as
/// empty strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    pub filename: Option<String>,
    pub filesize: Option<u64>,
    pub mimetype: Option<String>,
}

impl Handshake {
    /// Returns the three text frames in wire order.
    pub fn to_frames(&self) -> [String; 3] {
        [
            self.filename.clone().unwrap_or_default(),
            self.filesize.map(|s| s.to_string()).unwrap_or_default(),
            self.mimetype.clone().unwrap_or_default(),
        ]
    }

    /// Builds a handshake from the three received frames.
    ///
    /// An unparsable size is treated as unknown, matching uploaders that
    /// stream from a pipe.
    pub fn from_frames(filename: &str, filesize: &str, mimetype: &str) -> Self {
        Self {
            filename: non_empty(filename),
            filesize: filesize.trim().parse().ok(),
            mimetype: non_empty(mimetype),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Formats the relay's reply carrying the assigned code.
pub fn format_code_reply(code: &str) -> String {
    format!("{CODE_PREFIX}{code}")
}

/// Extracts the code from the relay's handshake reply.
pub fn parse_code_reply(text: &str) -> Result<String, ProtocolError> {
    text.trim()
        .strip_prefix(CODE_PREFIX)
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::InvalidCodeReply(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_for_seekable_file() {
        let hs = Handshake {
            filename: Some("movie.mp4".into()),
            filesize: Some(1234),
            mimetype: Some("video/mp4".into()),
        };
        assert_eq!(hs.to_frames(), ["movie.mp4", "1234", "video/mp4"]);
    }

    #[test]
    fn frames_for_pipe() {
        let hs = Handshake::default();
        assert_eq!(hs.to_frames(), ["", "", ""]);
        assert_eq!(Handshake::from_frames("", "", ""), hs);
    }

    #[test]
    fn unparsable_size_is_unknown() {
        let hs = Handshake::from_frames("a.txt", "lots", "text/plain");
        assert_eq!(hs.filesize, None);
        assert_eq!(hs.filename.as_deref(), Some("a.txt"));
    }

    #[test]
    fn code_reply() {
        let reply = format_code_reply("9fakr");
        assert_eq!(reply, "code=9fakr");
        assert_eq!(parse_code_reply(&reply).unwrap(), "9fakr");
        assert!(parse_code_reply("code=").is_err());
        assert!(parse_code_reply("nope").is_err());
    }
}
