//! validator performs cheap whole-file sanity checks, plus verification of an
//! optional hash-chained mutation ledger kept by an outside collaborator.

use byteorder::{BigEndian, ByteOrder};
use sha2::{Digest, Sha256};

use crate::dbheader;

/// One defect found by validation.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    #[error("File is shorter than the 100-byte header.")]
    TooShort,
    #[error("Header magic does not spell \"SQLite format 3\".")]
    BadMagic,
    #[error("Page size {0} is not a power of two between 512 and 65536.")]
    BadPageSize(u32),
    #[error("Read version {0} requires WAL support.")]
    UnsupportedReadVersion(u8),
    #[error("File length {len} is not a multiple of the page size {page_size}.")]
    Misaligned { len: u64, page_size: u32 },
    #[error("In-header page count {header} exceeds the file's {actual} pages.")]
    PageCountBeyondFile { header: u32, actual: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub page_size: Option<u32>,
    pub file_pages: Option<u32>,
    pub issues: Vec<Issue>,
}

impl Report {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Validate a database image held in memory.
pub fn validate_bytes(image: &[u8]) -> Report {
    let mut issues = Vec::new();
    if image.len() < dbheader::HEADER_LEN {
        return Report {
            page_size: None,
            file_pages: None,
            issues: vec![Issue::TooShort],
        };
    }
    if &image[0..16] != b"SQLite format 3\0" {
        issues.push(Issue::BadMagic);
    }
    let page_size = match BigEndian::read_u16(&image[16..18]) {
        1 => 65536u32,
        x => x as u32,
    };
    let page_size = if dbheader::is_valid_page_size(page_size) {
        Some(page_size)
    } else {
        issues.push(Issue::BadPageSize(page_size));
        None
    };
    let read_version = image[19];
    if read_version > 1 {
        issues.push(Issue::UnsupportedReadVersion(read_version));
    }

    let mut file_pages = None;
    if let Some(ps) = page_size {
        let len = image.len() as u64;
        if len % ps as u64 != 0 {
            issues.push(Issue::Misaligned { len, page_size: ps });
        }
        let actual = (len / ps as u64) as u32;
        file_pages = Some(actual);
        let header_pages = BigEndian::read_u32(&image[28..32]);
        if header_pages > actual {
            issues.push(Issue::PageCountBeyondFile {
                header: header_pages,
                actual,
            });
        }
    }
    Report {
        page_size,
        file_pages,
        issues,
    }
}

/// Validate a database file on disk.
pub fn validate_file(path: &std::path::Path) -> Result<Report, std::io::Error> {
    // The checks only need the header plus the file length; still, small
    // databases are simply read whole.
    let meta = std::fs::metadata(path)?;
    let mut head = vec![0u8; dbheader::HEADER_LEN];
    {
        use std::io::Read;
        let mut f = std::fs::File::open(path)?;
        let n = f.read(&mut head)?;
        head.truncate(n);
    }
    if head.len() < dbheader::HEADER_LEN {
        return Ok(Report {
            page_size: None,
            file_pages: None,
            issues: vec![Issue::TooShort],
        });
    }
    // Re-run the byte checks with the real file length substituted.
    let mut report = validate_bytes(&head);
    report.issues.retain(|i| !matches!(i, Issue::Misaligned { .. } | Issue::PageCountBeyondFile { .. }));
    if let Some(ps) = report.page_size {
        let len = meta.len();
        if len % ps as u64 != 0 {
            report.issues.push(Issue::Misaligned { len, page_size: ps });
        }
        let actual = (len / ps as u64) as u32;
        report.file_pages = Some(actual);
        let header_pages = BigEndian::read_u32(&head[28..32]);
        if header_pages > actual {
            report.issues.push(Issue::PageCountBeyondFile {
                header: header_pages,
                actual,
            });
        }
    }
    Ok(report)
}

// ------------------------------------------------------------------
// Hash-chained mutation ledger.

/// One entry of a collaborator-kept mutation log.  Entries chain by hash:
/// each carries the hash of its predecessor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub seq: u64,
    pub prev_hash: [u8; 32],
    pub payload: Vec<u8>,
}

/// Collaborator capability: hand over the ledger entries in sequence order.
pub trait MutationLedger {
    fn entries(&self) -> Vec<LedgerEntry>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReport {
    pub chain_intact: bool,
    pub entry_count: usize,
    /// Sequence number of the first entry whose `prev_hash` does not match.
    pub first_divergence: Option<u64>,
}

/// Hash of one entry, chaining input for its successor.
pub fn entry_hash(entry: &LedgerEntry) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(entry.prev_hash);
    h.update(entry.seq.to_be_bytes());
    h.update(&entry.payload);
    h.finalize().into()
}

/// Check that every entry's `prev_hash` equals the computed hash of its
/// predecessor (the first entry must carry all zeroes).
pub fn verify_ledger(ledger: &dyn MutationLedger) -> LedgerReport {
    let entries = ledger.entries();
    let mut expected = [0u8; 32];
    let mut first_divergence = None;
    for entry in &entries {
        if entry.prev_hash != expected {
            first_divergence = Some(entry.seq);
            break;
        }
        expected = entry_hash(entry);
    }
    LedgerReport {
        chain_intact: first_divergence.is_none(),
        entry_count: entries.len(),
        first_divergence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbheader::DbHeader;

    fn valid_image(pages: u32, page_size: u32) -> Vec<u8> {
        let mut image = vec![0u8; (pages * page_size) as usize];
        let mut h = DbHeader::new(page_size);
        h.page_count = pages;
        dbheader::write(&mut image, &h);
        image
    }

    #[test]
    fn test_valid_image_passes() {
        let report = validate_bytes(&valid_image(3, 512));
        assert!(report.is_valid(), "{:?}", report.issues);
        assert_eq!(report.page_size, Some(512));
        assert_eq!(report.file_pages, Some(3));
    }

    #[test]
    fn test_each_issue_detected() {
        let mut image = valid_image(2, 512);
        image[0] = b'X';
        assert!(validate_bytes(&image).issues.contains(&Issue::BadMagic));

        let mut image = valid_image(2, 512);
        image[19] = 2;
        assert!(validate_bytes(&image)
            .issues
            .contains(&Issue::UnsupportedReadVersion(2)));

        let mut image = valid_image(2, 512);
        image.extend_from_slice(&[0u8; 100]); // ragged tail
        assert!(validate_bytes(&image)
            .issues
            .iter()
            .any(|i| matches!(i, Issue::Misaligned { .. })));

        let mut image = valid_image(2, 512);
        BigEndian::write_u32(&mut image[28..32], 99);
        assert!(validate_bytes(&image)
            .issues
            .iter()
            .any(|i| matches!(i, Issue::PageCountBeyondFile { header: 99, actual: 2 })));

        assert_eq!(validate_bytes(&[0u8; 10]).issues, vec![Issue::TooShort]);
    }

    struct VecLedger(Vec<LedgerEntry>);

    impl MutationLedger for VecLedger {
        fn entries(&self) -> Vec<LedgerEntry> {
            self.0.clone()
        }
    }

    fn chain(payloads: &[&[u8]]) -> Vec<LedgerEntry> {
        let mut prev = [0u8; 32];
        payloads
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let e = LedgerEntry {
                    seq: i as u64,
                    prev_hash: prev,
                    payload: p.to_vec(),
                };
                prev = entry_hash(&e);
                e
            })
            .collect()
    }

    #[test]
    fn test_intact_chain() {
        let ledger = VecLedger(chain(&[b"insert 1", b"delete 2", b"insert 3"]));
        let report = verify_ledger(&ledger);
        assert!(report.chain_intact);
        assert_eq!(report.entry_count, 3);
        assert_eq!(report.first_divergence, None);
    }

    #[test]
    fn test_tampered_chain_reports_first_divergence() {
        let mut entries = chain(&[b"a", b"b", b"c", b"d"]);
        entries[1].payload = b"B".to_vec(); // entry 2's prev_hash no longer matches
        let report = verify_ledger(&VecLedger(entries));
        assert!(!report.chain_intact);
        assert_eq!(report.first_divergence, Some(2));
    }

    #[test]
    fn test_empty_ledger_is_intact() {
        let report = verify_ledger(&VecLedger(vec![]));
        assert!(report.chain_intact);
        assert_eq!(report.entry_count, 0);
    }
}
