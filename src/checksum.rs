//! Checksum utilities
//!
//! Two checksums travel with every transfer:
//!
//! - **CRC-32 (IEEE)**, hex encoded, sent in the `Content-CRC32` request
//!   header on the gateway path and echoed back into the merge body.
//! - **CRC-64 (ECMA-182, reflected, a.k.a. CRC-64/XZ)**, decimal encoded,
//!   compared against the `x-tos-hash-crc64ecma` response header on the
//!   VPC direct path.

use crc::{Crc, Digest, CRC_64_XZ};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Header value telling the gateway to skip CRC-32 verification.
///
/// Used whenever the body is streamed and cannot be hashed up front.
pub const UNVERIFIED_CRC32: &str = "Ignore";

static CRC64_ECMA: Crc<u64> = Crc::<u64>::new(&CRC_64_XZ);

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// CRC-32 of `data`, formatted as 8 lowercase hex digits.
pub fn crc32_hex(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

/// CRC-64/ECMA of `data`.
pub fn crc64_ecma(data: &[u8]) -> u64 {
    CRC64_ECMA.checksum(data)
}

/// CRC-64/ECMA of `data` in the decimal form storage reports it in.
pub fn crc64_ecma_string(data: &[u8]) -> String {
    crc64_ecma(data).to_string()
}

/// Incremental CRC-64/ECMA over content that arrives in pieces.
pub struct Crc64Digest {
    digest: Digest<'static, u64>,
    bytes: u64,
}

impl Crc64Digest {
    pub fn new() -> Self {
        Self {
            digest: CRC64_ECMA.digest(),
            bytes: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.digest.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> u64 {
        self.digest.finalize()
    }

    pub fn finalize_string(self) -> String {
        self.finalize().to_string()
    }
}

impl Default for Crc64Digest {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain `reader` and return its CRC-64/ECMA along with the byte count.
pub async fn crc64_ecma_of_reader<R>(reader: &mut R) -> std::io::Result<(String, u64)>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut digest = Crc64Digest::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    let bytes = digest.bytes();
    Ok((digest.finalize_string(), bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_hex_known_value() {
        // Standard CRC-32 check value
        assert_eq!(crc32_hex(b"123456789"), "cbf43926");
    }

    #[test]
    fn test_crc32_hex_is_zero_padded() {
        assert_eq!(crc32_hex(b""), "00000000");
        assert_eq!(crc32_hex(b"a").len(), 8);
    }

    #[test]
    fn test_crc64_ecma_known_value() {
        // CRC-64/XZ check value
        assert_eq!(crc64_ecma(b"123456789"), 0x995d_c9bb_df19_39fa);
        assert_eq!(crc64_ecma_string(b"123456789"), "11051210869376104954");
    }

    #[test]
    fn test_incremental_matches_whole_buffer() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut digest = Crc64Digest::new();
        for chunk in data.chunks(777) {
            digest.update(chunk);
        }
        assert_eq!(digest.bytes(), data.len() as u64);
        assert_eq!(digest.finalize(), crc64_ecma(&data));
    }

    #[tokio::test]
    async fn test_crc64_of_reader() {
        let data = vec![7u8; 200 * 1024];
        let mut reader = std::io::Cursor::new(data.clone());
        let (crc, len) = crc64_ecma_of_reader(&mut reader).await.unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(crc, crc64_ecma_string(&data));
    }
}
