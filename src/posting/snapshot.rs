// # Shard Snapshot Format
//
// Binary serialization of a full shard:
//
//   header : magic "SFM1", version u8, hash_width u8, window_size u8,
//            group_size u8, offset u64 LE, size u64 LE, group_count u64 LE
//   body   : per group, a 1-byte popcount; occupied groups follow with the
//            group bitmap (ceil(G/8) bytes) and one slot block per set bit:
//            varint posting count, then delta-varint postings
//            (doctype delta, docid delta, position delta)
//   trailer: CRC32C over the body, u32 LE
//
// A CRC mismatch is an Internal error: the snapshot is corrupt and the shard
// must not serve from it.

use std::io::{Read, Write};

use crate::document::{DocumentId, HashKey};
use crate::error::{MatchError, Result};
use crate::posting::shard::{Group, PostingShard};
use crate::posting::Posting;

pub const SNAPSHOT_MAGIC: [u8; 4] = *b"SFM1";
pub const SNAPSHOT_VERSION: u8 = 1;

struct CrcWriter<'a, W: Write> {
    inner: &'a mut W,
    crc: u32,
}

impl<'a, W: Write> Write for CrcWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc = crc32c::crc32c_append(self.crc, &buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct CrcReader<'a, R: Read> {
    inner: &'a mut R,
    crc: u32,
}

impl<'a, R: Read> Read for CrcReader<'a, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.crc = crc32c::crc32c_append(self.crc, &buf[..n]);
        Ok(n)
    }
}

fn write_varint<W: Write>(w: &mut W, mut value: u64) -> std::io::Result<()> {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            return w.write_all(&[byte]);
        }
        w.write_all(&[byte | 0x80])?;
    }
}

fn read_varint<R: Read>(r: &mut R) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte)?;
        if shift >= 64 {
            return Err(MatchError::Invalid("varint overflows u64".to_string()));
        }
        value |= ((byte[0] & 0x7f) as u64) << shift;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn bitmap_bytes(group_size: u32) -> usize {
    ((group_size + 7) / 8) as usize
}

fn write_slot<W: Write>(w: &mut W, postings: &[Posting]) -> std::io::Result<()> {
    write_varint(w, postings.len() as u64)?;
    let mut prev = Posting::new(DocumentId::new(0, 0), 0);
    for p in postings {
        let doctype_delta = p.doc.doctype - prev.doc.doctype;
        write_varint(w, doctype_delta as u64)?;
        let docid_delta = if doctype_delta > 0 {
            p.doc.docid
        } else {
            p.doc.docid - prev.doc.docid
        };
        write_varint(w, docid_delta as u64)?;
        let position_delta = if doctype_delta > 0 || docid_delta > 0 {
            p.position
        } else {
            p.position - prev.position
        };
        write_varint(w, position_delta as u64)?;
        prev = *p;
    }
    Ok(())
}

fn read_slot<R: Read>(r: &mut R) -> Result<Vec<Posting>> {
    let count = read_varint(r)? as usize;
    if count == 0 {
        return Err(MatchError::Invalid(
            "snapshot slot with zero postings".to_string(),
        ));
    }
    let mut postings = Vec::with_capacity(count);
    let mut prev = Posting::new(DocumentId::new(0, 0), 0);
    for _ in 0..count {
        let doctype_delta = read_varint(r)? as u32;
        let docid_delta = read_varint(r)? as u32;
        let position_delta = read_varint(r)? as u32;
        let doctype = prev.doc.doctype + doctype_delta;
        let docid = if doctype_delta > 0 {
            docid_delta
        } else {
            prev.doc.docid + docid_delta
        };
        let position = if doctype_delta > 0 || docid_delta > 0 {
            position_delta
        } else {
            prev.position + position_delta
        };
        prev = Posting::new(DocumentId::new(doctype, docid), position);
        postings.push(prev);
    }
    Ok(postings)
}

/// Serialize the shard's full state. Callers must quiesce writers first; the
/// posting server holds its write gate across this call.
pub fn write_snapshot<W: Write>(shard: &PostingShard, key: HashKey, w: &mut W) -> Result<()> {
    w.write_all(&SNAPSHOT_MAGIC)?;
    w.write_all(&[
        SNAPSHOT_VERSION,
        key.hash_width as u8,
        key.window_size as u8,
        shard.group_size() as u8,
    ])?;
    w.write_all(&shard.offset().to_le_bytes())?;
    let size = shard
        .end()
        .wrapping_sub(shard.offset())
        .wrapping_add(1);
    w.write_all(&size.to_le_bytes())?;
    w.write_all(&shard.group_count().to_le_bytes())?;

    let nbytes = bitmap_bytes(shard.group_size());
    let mut body = CrcWriter { inner: w, crc: 0 };
    for group_key in 0..shard.group_count() {
        match shard.group(group_key) {
            None => body.write_all(&[0u8])?,
            Some(group) => {
                body.write_all(&[group.bitmap.count_ones() as u8])?;
                body.write_all(&group.bitmap.to_le_bytes()[..nbytes])?;
                for slot in &group.slots {
                    write_slot(&mut body, slot)?;
                }
            }
        }
    }
    let crc = body.crc;
    w.write_all(&crc.to_le_bytes())?;
    w.flush()?;
    Ok(())
}

/// Deserialize a snapshot into a fresh shard. The header must match the
/// server's own key and window; a CRC mismatch is fatal to the shard.
pub fn read_snapshot<R: Read>(
    r: &mut R,
    key: HashKey,
    offset: u64,
    size: u64,
    group_size: u32,
) -> Result<PostingShard> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(MatchError::Invalid("bad snapshot magic".to_string()));
    }
    let mut head = [0u8; 4];
    r.read_exact(&mut head)?;
    if head[0] != SNAPSHOT_VERSION {
        return Err(MatchError::Invalid(format!(
            "unsupported snapshot version {}",
            head[0]
        )));
    }
    if head[1] as u32 != key.hash_width
        || head[2] as u32 != key.window_size
        || head[3] as u32 != group_size
    {
        return Err(MatchError::Invalid(format!(
            "snapshot key mismatch: width {} window {} group {} vs expected {:?} group {}",
            head[1], head[2], head[3], key, group_size
        )));
    }

    let mut word = [0u8; 8];
    r.read_exact(&mut word)?;
    let snap_offset = u64::from_le_bytes(word);
    r.read_exact(&mut word)?;
    let snap_size = u64::from_le_bytes(word);
    if snap_offset != offset || snap_size != size {
        return Err(MatchError::Invalid(format!(
            "snapshot window mismatch: offset {} size {} vs expected offset {} size {}",
            snap_offset, snap_size, offset, size
        )));
    }
    r.read_exact(&mut word)?;
    let group_count = u64::from_le_bytes(word);

    let shard = PostingShard::new(offset, size, group_size)?;
    if group_count != shard.group_count() {
        return Err(MatchError::Invalid(format!(
            "snapshot group count {} does not cover window ({} expected)",
            group_count,
            shard.group_count()
        )));
    }

    let nbytes = bitmap_bytes(group_size);
    let mut body = CrcReader { inner: r, crc: 0 };
    for group_key in 0..group_count {
        let mut popcount = [0u8; 1];
        body.read_exact(&mut popcount)?;
        if popcount[0] == 0 {
            continue;
        }
        let mut raw = [0u8; 8];
        body.read_exact(&mut raw[..nbytes])?;
        let bitmap = u64::from_le_bytes(raw);
        if bitmap.count_ones() != popcount[0] as u32 {
            return Err(MatchError::Invalid(format!(
                "group {} popcount {} disagrees with bitmap {:#b}",
                group_key, popcount[0], bitmap
            )));
        }
        let mut slots = Vec::with_capacity(popcount[0] as usize);
        for _ in 0..popcount[0] {
            slots.push(read_slot(&mut body)?);
        }
        shard.insert_group(group_key, Group { bitmap, slots });
    }

    let crc = body.crc;
    let mut trailer = [0u8; 4];
    r.read_exact(&mut trailer)?;
    if u32::from_le_bytes(trailer) != crc {
        return Err(MatchError::Internal(format!(
            "snapshot CRC mismatch: computed {:#010x}, stored {:#010x}",
            crc,
            u32::from_le_bytes(trailer)
        )));
    }
    Ok(shard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::posting::shard::DEFAULT_GROUP_SIZE;

    fn sample_shard() -> PostingShard {
        let shard = PostingShard::new(0, 1 << 23, DEFAULT_GROUP_SIZE).unwrap();
        // Spread postings over several groups, multiple docs per slot.
        for hash in (0..5000u64).step_by(61) {
            shard
                .add(hash, DocumentId::new(1, (hash % 7) as u32 + 1), hash as u32)
                .unwrap();
            shard
                .add(hash, DocumentId::new(2, 1), (hash / 2) as u32)
                .unwrap();
        }
        shard.add(0, DocumentId::new(1, 1), 0).unwrap();
        shard.add((1 << 23) - 1, DocumentId::new(9, 9), 42).unwrap();
        shard
    }

    #[test]
    fn test_snapshot_round_trip() {
        let key = HashKey::new(30, 24);
        let shard = sample_shard();
        let mut buf = Vec::new();
        write_snapshot(&shard, key, &mut buf).unwrap();

        let loaded =
            read_snapshot(&mut buf.as_slice(), key, 0, 1 << 23, DEFAULT_GROUP_SIZE).unwrap();
        assert_eq!(loaded.dump(), shard.dump());
        assert_eq!(loaded.posting_count(), shard.posting_count());
        assert_eq!(loaded.occupied_groups(), shard.occupied_groups());
    }

    #[test]
    fn test_snapshot_round_trip_on_disk() {
        let key = HashKey::new(30, 24);
        let shard = sample_shard();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shard-0.sfm");
        {
            let mut file = std::fs::File::create(&path).unwrap();
            write_snapshot(&shard, key, &mut file).unwrap();
        }
        let mut file = std::fs::File::open(&path).unwrap();
        let loaded = read_snapshot(&mut file, key, 0, 1 << 23, DEFAULT_GROUP_SIZE).unwrap();
        assert_eq!(loaded.dump(), shard.dump());
    }

    #[test]
    fn test_corrupt_trailer_is_internal_error() {
        let key = HashKey::new(30, 24);
        let shard = sample_shard();
        let mut buf = Vec::new();
        write_snapshot(&shard, key, &mut buf).unwrap();

        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        assert!(matches!(
            read_snapshot(&mut buf.as_slice(), key, 0, 1 << 23, DEFAULT_GROUP_SIZE),
            Err(MatchError::Internal(_))
        ));
    }

    #[test]
    fn test_corrupt_body_is_detected() {
        let key = HashKey::new(30, 24);
        let shard = sample_shard();
        let mut buf = Vec::new();
        write_snapshot(&shard, key, &mut buf).unwrap();

        // Flip a byte in the body (past the 31-byte header, before the
        // 4-byte trailer). Depending on what the byte encoded this surfaces
        // as a CRC mismatch, a structural error, or a truncated read; it must
        // never load cleanly.
        let target = buf.len() / 2;
        buf[target] ^= 0x01;
        assert!(read_snapshot(&mut buf.as_slice(), key, 0, 1 << 23, DEFAULT_GROUP_SIZE).is_err());
    }

    #[test]
    fn test_key_mismatch_rejected() {
        let key = HashKey::new(30, 24);
        let shard = sample_shard();
        let mut buf = Vec::new();
        write_snapshot(&shard, key, &mut buf).unwrap();

        let wrong = HashKey::new(15, 24);
        assert!(matches!(
            read_snapshot(&mut buf.as_slice(), wrong, 0, 1 << 23, DEFAULT_GROUP_SIZE),
            Err(MatchError::Invalid(_))
        ));
    }

    #[test]
    fn test_empty_shard_round_trips() {
        let key = HashKey::default();
        let shard = PostingShard::new(1 << 23, 1 << 23, DEFAULT_GROUP_SIZE).unwrap();
        let mut buf = Vec::new();
        write_snapshot(&shard, key, &mut buf).unwrap();
        let loaded =
            read_snapshot(&mut buf.as_slice(), key, 1 << 23, 1 << 23, DEFAULT_GROUP_SIZE).unwrap();
        assert!(loaded.is_empty());
        assert_eq!(loaded.group_count(), shard.group_count());
    }
}
