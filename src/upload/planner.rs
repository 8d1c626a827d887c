//! Part planner
//!
//! Splits `[0, total)` into contiguous parts of `chunk` bytes. The last part
//! absorbs the remainder instead of becoming a short extra part.

use super::UploadError;

/// Hard limit on the number of parts a multipart upload may have.
pub const MAX_PARTS: u64 = 10_000;

/// One contiguous byte range of the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartSpec {
    /// 1-based part number
    pub number: u32,
    pub offset: u64,
    pub length: u64,
}

/// Ordered, gap-free partition of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartPlan {
    total: u64,
    chunk: u64,
    parts: Vec<PartSpec>,
}

impl PartPlan {
    pub fn parts(&self) -> &[PartSpec] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.total
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PartSpec> {
        self.parts.iter()
    }
}

impl IntoIterator for PartPlan {
    type Item = PartSpec;
    type IntoIter = std::vec::IntoIter<PartSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.parts.into_iter()
    }
}

/// Plan the parts of a `total`-byte upload.
///
/// A total smaller than one chunk yields a single part of `total` bytes.
pub fn plan(total: u64, chunk: u64) -> Result<PartPlan, UploadError> {
    if total == 0 {
        return Err(UploadError::InvalidInput("file size is zero".into()));
    }
    if chunk == 0 {
        return Err(UploadError::InvalidInput("chunk size is zero".into()));
    }

    let whole = total / chunk;
    if whole > MAX_PARTS {
        return Err(UploadError::TooManyParts { parts: whole });
    }

    let count = whole.max(1);
    let mut parts = Vec::with_capacity(count as usize);
    for i in 0..count {
        let offset = i * chunk;
        let length = if i + 1 == count { total - offset } else { chunk };
        parts.push(PartSpec {
            number: (i + 1) as u32,
            offset,
            length,
        });
    }

    Ok(PartPlan {
        total,
        chunk,
        parts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn assert_contiguous(plan: &PartPlan, total: u64, chunk: u64) {
        let mut expected_offset = 0;
        for (i, part) in plan.iter().enumerate() {
            assert_eq!(part.number as usize, i + 1);
            assert_eq!(part.offset, expected_offset);
            if i + 1 < plan.len() {
                assert_eq!(part.length, chunk);
            }
            expected_offset += part.length;
        }
        assert_eq!(expected_offset, total);
    }

    #[test]
    fn test_exact_multiple() {
        let plan = plan(30, 10).unwrap();
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|p| p.length == 10));
    }

    #[test]
    fn test_last_part_absorbs_remainder() {
        let plan = plan(35, 10).unwrap();
        assert_eq!(plan.len(), 3);
        assert_eq!(plan.parts()[2], PartSpec { number: 3, offset: 20, length: 15 });
    }

    #[test]
    fn test_smaller_than_chunk_is_single_part() {
        let plan = plan(7, 10).unwrap();
        assert_eq!(plan.parts(), &[PartSpec { number: 1, offset: 0, length: 7 }]);
    }

    #[test]
    fn test_too_many_parts() {
        let err = plan(100_000_000_000, 1).unwrap_err();
        assert!(matches!(err, UploadError::TooManyParts { .. }));

        assert!(plan(MAX_PARTS, 1).is_ok());
        assert!(plan(MAX_PARTS + 1, 1).is_err());
    }

    #[test]
    fn test_zero_inputs_rejected() {
        assert!(matches!(plan(0, 10), Err(UploadError::InvalidInput(_))));
        assert!(matches!(plan(10, 0), Err(UploadError::InvalidInput(_))));
    }

    #[test]
    fn test_random_plans_cover_total() {
        let mut rng = rand::rng();
        for _ in 0..500 {
            let chunk = rng.random_range(1..=4096u64);
            let total = rng.random_range(1..=chunk * 200);
            let plan = plan(total, chunk).unwrap();
            assert_contiguous(&plan, total, chunk);
        }
    }
}
