//! Split key discovery

use crate::error::Result;
use crate::keys;
use crate::mvcc::reader::mvcc_iterate_versions;
use crate::storage::Reader;

/// Find a user key in `[start, end)` splitting the span's user data roughly
/// in half by size. Never returns a key inside one key's versions, and never
/// the first key of the span. `None` if the span holds fewer than two keys.
pub fn mvcc_find_split_key<R: Reader + ?Sized>(
    reader: &R,
    start: &[u8],
    end: &[u8],
) -> Result<Option<Vec<u8>>> {
    let span = keys::user_data_span(start, end);
    let mut sizes: Vec<(Vec<u8>, i64)> = Vec::new();
    mvcc_iterate_versions(reader, &span.key, &span.end_key, &mut |mk, v| {
        let size = (mk.encoded_size() + v.len() as i64).max(1);
        match sizes.last_mut() {
            Some((k, s)) if *k == mk.key => *s += size,
            _ => sizes.push((mk.key.clone(), size)),
        }
        Ok(true)
    })?;
    if sizes.len() < 2 {
        return Ok(None);
    }

    let total: i64 = sizes.iter().map(|(_, s)| s).sum();
    let target = total / 2;
    let mut before = sizes[0].1;
    let mut best: Option<(i64, usize)> = None;
    for (i, (_, size)) in sizes.iter().enumerate().skip(1) {
        let diff = (before - target).abs();
        if best.map_or(true, |(d, _)| diff < d) {
            best = Some((diff, i));
        }
        before += size;
    }
    Ok(best.map(|(_, i)| sizes[i].0.clone()))
}
