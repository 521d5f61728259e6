//! On-disk framing shared by the file-backed stores.
//!
//! Layout: `[magic byte][varint format version]` header, followed by zero or
//! more records of `varint(len(update)) | update | varint(len(metadata)) |
//! metadata | 8-byte-LE f64 timestamp`. Squashing rewrites the whole file to
//! a fresh header plus a single record.

use syncboard_common::{Error, Result, Timestamp};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAGIC: u8 = 0x59; // 'Y'
pub const FORMAT_VERSION: u64 = 1;

pub async fn write_header<W: AsyncWrite + Unpin>(w: &mut W) -> Result<()> {
    let mut buf = vec![MAGIC];
    write_var_u64(&mut buf, FORMAT_VERSION);
    w.write_all(&buf).await.map_err(Error::Io)
}

/// Returns the version found in the header, so the caller can decide
/// whether it's one this build understands.
pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
    let mut magic = [0u8; 1];
    r.read_exact(&mut magic)
        .await
        .map_err(|_| Error::Decode("store file too short for header".into()))?;
    if magic[0] != MAGIC {
        return Err(Error::Decode("bad store magic byte".into()));
    }
    read_var_u64(r).await
}

pub async fn write_record<W: AsyncWrite + Unpin>(
    w: &mut W,
    update: &[u8],
    metadata: &[u8],
    ts: Timestamp,
) -> Result<()> {
    let mut buf = Vec::with_capacity(update.len() + metadata.len() + 16);
    write_var_u64(&mut buf, update.len() as u64);
    buf.extend_from_slice(update);
    write_var_u64(&mut buf, metadata.len() as u64);
    buf.extend_from_slice(metadata);
    buf.extend_from_slice(&ts.to_le_bytes());
    w.write_all(&buf).await.map_err(Error::Io)
}

/// Read one record, or `Ok(None)` at a clean end-of-file (no partial bytes
/// read at all). A record that starts but runs out of bytes partway through
/// is a corrupt tail, reported as `Error::Decode` so the caller can enter
/// degraded mode instead of losing the whole store.
pub async fn read_record<R: AsyncRead + Unpin>(
    r: &mut R,
) -> Result<Option<(Vec<u8>, Vec<u8>, Timestamp)>> {
    let len = match read_var_u64_opt(r).await? {
        Some(len) => len,
        None => return Ok(None),
    };
    let mut update = vec![0u8; len as usize];
    r.read_exact(&mut update)
        .await
        .map_err(|_| Error::Decode("truncated update record".into()))?;
    let meta_len = read_var_u64(r).await.map_err(|_| Error::Decode("truncated metadata length".into()))?;
    let mut metadata = vec![0u8; meta_len as usize];
    r.read_exact(&mut metadata)
        .await
        .map_err(|_| Error::Decode("truncated metadata".into()))?;
    let mut ts_bytes = [0u8; 8];
    r.read_exact(&mut ts_bytes)
        .await
        .map_err(|_| Error::Decode("truncated record timestamp".into()))?;
    Ok(Some((update, metadata, Timestamp::from_le_bytes(ts_bytes))))
}

pub fn write_var_u64(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

async fn read_var_u64<R: AsyncRead + Unpin>(r: &mut R) -> Result<u64> {
    read_var_u64_opt(r)
        .await?
        .ok_or_else(|| Error::Decode("unexpected end of stream reading varint".into()))
}

/// Like [`read_var_u64`] but returns `Ok(None)` if the stream ends before
/// any byte of the varint is read (a clean EOF at a record boundary).
async fn read_var_u64_opt<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<u64>> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    let mut first = true;
    loop {
        let mut byte = [0u8; 1];
        match r.read_exact(&mut byte).await {
            Ok(()) => {}
            Err(_) if first => return Ok(None),
            Err(_) => return Err(Error::Decode("truncated varint".into())),
        }
        let byte = byte[0];
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
        shift += 7;
        first = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn header_round_trips() {
        let mut buf = Vec::new();
        write_header(&mut buf).await.unwrap();
        let version = read_header(&mut Cursor::new(buf)).await.unwrap();
        assert_eq!(version, FORMAT_VERSION);
    }

    #[tokio::test]
    async fn record_round_trips() {
        let ts = Timestamp(123.456);
        let mut buf = Vec::new();
        write_record(&mut buf, b"hello", b"author-1", ts).await.unwrap();
        let mut cur = Cursor::new(buf);
        let (update, metadata, read_ts) = read_record(&mut cur).await.unwrap().unwrap();
        assert_eq!(update, b"hello");
        assert_eq!(metadata, b"author-1");
        assert_eq!(read_ts.0, ts.0);
        assert!(read_record(&mut cur).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_with_empty_metadata_round_trips() {
        let ts = Timestamp(1.0);
        let mut buf = Vec::new();
        write_record(&mut buf, b"hello", b"", ts).await.unwrap();
        let mut cur = Cursor::new(buf);
        let (update, metadata, _) = read_record(&mut cur).await.unwrap().unwrap();
        assert_eq!(update, b"hello");
        assert!(metadata.is_empty());
    }

    #[tokio::test]
    async fn truncated_record_is_an_error_not_a_silent_stop() {
        let mut buf = Vec::new();
        write_var_u64(&mut buf, 10); // claims 10 bytes of payload
        buf.extend_from_slice(b"short"); // only provides 5
        let mut cur = Cursor::new(buf);
        assert!(read_record(&mut cur).await.is_err());
    }
}
