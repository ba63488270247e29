//! LMWB bundle container.
//!
//! A bundle carries the application image and the filesystem image in one
//! stream so a single download updates both:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "LMWB"
//! 4       4     app_size (little endian)
//! 8       4     fs_size  (little endian)
//! 12      4     reserved
//! 16      ...   app image, then fs image, no framing in between
//! ```

use super::OtaError;

pub const MAGIC: [u8; 4] = *b"LMWB";
pub const HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BundleHeader {
    pub app_size: u32,
    pub fs_size: u32,
}

impl BundleHeader {
    /// Length of the whole bundle stream this header describes.
    pub fn total_len(&self) -> usize {
        HEADER_SIZE + self.app_size as usize + self.fs_size as usize
    }
}

pub fn is_bundle(prefix: &[u8]) -> bool {
    prefix.len() >= MAGIC.len() && prefix[..MAGIC.len()] == MAGIC
}

pub fn parse_header(raw: &[u8; HEADER_SIZE]) -> Result<BundleHeader, OtaError> {
    if !is_bundle(raw) {
        return Err(OtaError::InvalidBundle("bad magic"));
    }
    let app_size = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let fs_size = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
    if app_size == 0 {
        return Err(OtaError::InvalidBundle("empty firmware segment"));
    }
    if fs_size == 0 {
        return Err(OtaError::InvalidBundle("empty filesystem segment"));
    }
    Ok(BundleHeader { app_size, fs_size })
}

pub fn encode_header(app_size: u32, fs_size: u32) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&MAGIC);
    header[4..8].copy_from_slice(&app_size.to_le_bytes());
    header[8..12].copy_from_slice(&fs_size.to_le_bytes());
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn decodes_known_header() {
        let header = parse_header(&encode_header(1000, 2000)).unwrap();
        assert_eq!(header.app_size, 1000);
        assert_eq!(header.fs_size, 2000);
        assert_eq!(header.total_len(), 3016);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut raw = encode_header(1000, 2000);
        raw[0] = b'X';
        assert_eq!(
            parse_header(&raw),
            Err(OtaError::InvalidBundle("bad magic"))
        );
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(parse_header(&encode_header(0, 2000)).is_err());
        assert!(parse_header(&encode_header(1000, 0)).is_err());
    }

    #[test]
    fn plain_firmware_is_not_a_bundle() {
        // ESP app images start with 0xE9
        assert!(!is_bundle(&[0xE9, 0x05, 0x02, 0x20]));
        assert!(!is_bundle(b"LM"));
        assert!(is_bundle(b"LMWB\x00\x00"));
    }

    proptest! {
        #[test]
        fn nonzero_sizes_survive_encoding(app in 1u32.., fs in 1u32..) {
            let header = parse_header(&encode_header(app, fs)).unwrap();
            prop_assert_eq!(header, BundleHeader { app_size: app, fs_size: fs });
        }

        #[test]
        fn reserved_bytes_are_ignored(app in 1u32.., fs in 1u32.., reserved in any::<[u8; 4]>()) {
            let mut raw = encode_header(app, fs);
            raw[12..].copy_from_slice(&reserved);
            prop_assert!(parse_header(&raw).is_ok());
        }
    }
}
