use std::io::Read;
use std::path::Path;

// Same window binaryornot and git use for their content sniff.
const SNIFF_LEN: usize = 8192;

/// Content-based binary check: a NUL byte in the leading window marks the
/// file as binary. Unreadable files count as binary so the indexer stores
/// them path-only instead of failing the task.
pub fn is_binary(path: &Path) -> bool {
    let Ok(file) = std::fs::File::open(path) else {
        return true;
    };
    let mut buf = [0u8; SNIFF_LEN];
    let mut handle = file.take(SNIFF_LEN as u64);
    let Ok(n) = handle.read(&mut buf) else {
        return true;
    };
    buf[..n].contains(&0)
}
