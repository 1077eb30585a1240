//! Media type allow-set and content signature checks.
//!
//! Declared MIME types are checked against a fixed allow-set at session
//! creation. The first chunk of a session is additionally sniffed: when the
//! declared type has a known leading-byte signature, the payload must match
//! it. Types without a signature rule are accepted as declared.

use std::fmt;

/// The set of media types the coordinator accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaType {
    Jpeg,
    Png,
    Gif,
    Mp4,
    Webm,
    Pdf,
    PlainText,
    OctetStream,
}

/// Leading-byte signatures keyed by media type.
///
/// Only entries listed here are sniffed; everything else in the allow-set is
/// accepted on declaration alone.
const SIGNATURES: &[(MediaType, &[u8])] = &[
    (MediaType::Jpeg, &[0xFF, 0xD8, 0xFF]),
    (MediaType::Png, &[0x89, 0x50, 0x4E, 0x47]),
    (MediaType::Gif, &[0x47, 0x49, 0x46, 0x38]),
    (
        MediaType::Mp4,
        &[0x00, 0x00, 0x00, 0x20, 0x66, 0x74, 0x79, 0x70],
    ),
    (MediaType::Webm, &[0x1A, 0x45, 0xDF, 0xA3]),
];

impl MediaType {
    /// Parse a declared MIME string against the allow-set.
    pub fn parse(mime: &str) -> crate::Result<Self> {
        match mime {
            "image/jpeg" => Ok(Self::Jpeg),
            "image/png" => Ok(Self::Png),
            "image/gif" => Ok(Self::Gif),
            "video/mp4" => Ok(Self::Mp4),
            "video/webm" => Ok(Self::Webm),
            "application/pdf" => Ok(Self::Pdf),
            "text/plain" => Ok(Self::PlainText),
            "application/octet-stream" => Ok(Self::OctetStream),
            other => Err(crate::Error::UnsupportedMediaType(other.to_string())),
        }
    }

    /// The canonical MIME string for this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::Mp4 => "video/mp4",
            Self::Webm => "video/webm",
            Self::Pdf => "application/pdf",
            Self::PlainText => "text/plain",
            Self::OctetStream => "application/octet-stream",
        }
    }

    /// The leading-byte signature for this type, if one is defined.
    pub fn signature(&self) -> Option<&'static [u8]> {
        SIGNATURES
            .iter()
            .find(|(ty, _)| ty == self)
            .map(|(_, sig)| *sig)
    }

    /// Check the first chunk of a session against this type's signature.
    ///
    /// Types without a signature rule accept any payload.
    pub fn check_leading_bytes(&self, payload: &[u8]) -> crate::Result<()> {
        let Some(signature) = self.signature() else {
            return Ok(());
        };
        if payload.len() >= signature.len() && &payload[..signature.len()] == signature {
            Ok(())
        } else {
            Err(crate::Error::SignatureMismatch {
                declared: self.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_set_parses() {
        for (mime, expected) in [
            ("image/jpeg", MediaType::Jpeg),
            ("image/png", MediaType::Png),
            ("image/gif", MediaType::Gif),
            ("video/mp4", MediaType::Mp4),
            ("video/webm", MediaType::Webm),
            ("application/pdf", MediaType::Pdf),
            ("text/plain", MediaType::PlainText),
            ("application/octet-stream", MediaType::OctetStream),
        ] {
            assert_eq!(MediaType::parse(mime).unwrap(), expected);
            assert_eq!(expected.as_str(), mime);
        }
    }

    #[test]
    fn unknown_types_rejected() {
        assert!(MediaType::parse("image/webp").is_err());
        assert!(MediaType::parse("application/zip").is_err());
        assert!(MediaType::parse("").is_err());
    }

    #[test]
    fn jpeg_signature_matches() {
        let jpeg = MediaType::Jpeg;
        jpeg.check_leading_bytes(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00])
            .unwrap();
        assert!(jpeg.check_leading_bytes(&[0x89, 0x50, 0x4E, 0x47]).is_err());
        // Shorter than the signature cannot match.
        assert!(jpeg.check_leading_bytes(&[0xFF, 0xD8]).is_err());
    }

    #[test]
    fn png_declared_jpeg_bytes_rejected() {
        let png = MediaType::Png;
        assert!(png.check_leading_bytes(&[0xFF, 0xD8, 0xFF, 0x00]).is_err());
    }

    #[test]
    fn mp4_signature_includes_ftyp_box() {
        let mp4 = MediaType::Mp4;
        let mut payload = vec![0x00, 0x00, 0x00, 0x20, 0x66, 0x74, 0x79, 0x70];
        payload.extend_from_slice(b"isom");
        mp4.check_leading_bytes(&payload).unwrap();
    }

    #[test]
    fn unsignatured_types_accept_anything() {
        for ty in [MediaType::Pdf, MediaType::PlainText, MediaType::OctetStream] {
            assert!(ty.signature().is_none());
            ty.check_leading_bytes(&[0x00, 0x01, 0x02]).unwrap();
            ty.check_leading_bytes(&[]).unwrap();
        }
    }
}
