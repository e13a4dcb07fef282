//! Incremental Annex B elementary stream reader.
//!
//! The capture process writes raw H.264 with units delimited by 3- or 4-byte
//! start codes. The reader buffers just enough of the stream to hand back one
//! complete unit at a time; unit boundaries never depend on read sizes.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::H264Error;

pub const NAL_TYPE_IDR: u8 = 5;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;

/// One coded unit, start code stripped. `data` still includes the one-byte
/// NAL header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    pub unit_type: u8,
    pub data: Vec<u8>,
}

impl NalUnit {
    pub fn is_parameter_set(&self) -> bool {
        matches!(self.unit_type, NAL_TYPE_SPS | NAL_TYPE_PPS)
    }

    pub fn is_idr(&self) -> bool {
        self.unit_type == NAL_TYPE_IDR
    }
}

pub struct AnnexBReader<R> {
    source: R,
    buf: Vec<u8>,
    synced: bool,
    eof: bool,
}

impl<R: AsyncRead + Unpin> AnnexBReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            buf: Vec::with_capacity(4096),
            synced: false,
            eof: false,
        }
    }

    /// Next complete unit, or `Ok(None)` once the stream is exhausted.
    ///
    /// A unit is returned only when the following start code (or end of
    /// stream) has been seen, so `data` is always the unit's full payload.
    pub async fn next_unit(&mut self) -> Result<Option<NalUnit>, H264Error> {
        loop {
            // Sync to the first start code. Anything else at the head of the
            // stream means this is not an Annex B elementary stream.
            if !self.synced {
                if self.buf.starts_with(&[0, 0, 1]) {
                    self.buf.drain(..3);
                    self.synced = true;
                } else if self.buf.starts_with(&[0, 0, 0, 1]) {
                    self.buf.drain(..4);
                    self.synced = true;
                } else if self.buf.len() >= 4 || (self.eof && !self.buf.is_empty()) {
                    return Err(H264Error::MissingStartCode);
                } else if self.eof {
                    return Ok(None);
                }
            }

            if self.synced {
                if let Some((end, code_len)) = find_start_code(&self.buf) {
                    let unit = make_unit(&self.buf[..end]);
                    self.buf.drain(..end + code_len);
                    match unit {
                        Some(unit) => return Ok(Some(unit)),
                        // Adjacent start codes delimit an empty unit; skip it.
                        None => continue,
                    }
                }
                if self.eof {
                    let unit = make_unit(&self.buf);
                    self.buf.clear();
                    return Ok(unit);
                }
            }

            let n = self.source.read_buf(&mut self.buf).await?;
            if n == 0 {
                self.eof = true;
            }
        }
    }
}

/// Position and length of the next start code, or `None` if the buffer holds
/// at most a partial one at its tail.
fn find_start_code(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i + 2 < buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 {
            if buf[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 3 < buf.len() && buf[i + 2] == 0 && buf[i + 3] == 1 {
                return Some((i, 4));
            }
        }
        i += 1;
    }
    None
}

fn make_unit(data: &[u8]) -> Option<NalUnit> {
    let (&header, _) = data.split_first()?;
    Some(NalUnit {
        unit_type: header & 0x1F,
        data: data.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn collect(stream: &[u8]) -> Vec<NalUnit> {
        let mut reader = AnnexBReader::new(Cursor::new(stream.to_vec()));
        let mut units = Vec::new();
        while let Some(unit) = reader.next_unit().await.unwrap() {
            units.push(unit);
        }
        units
    }

    #[tokio::test]
    async fn splits_units_on_start_codes() {
        let stream = [
            &[0, 0, 0, 1, 0x67, 0xAA][..],
            &[0, 0, 0, 1, 0x68, 0xBB],
            &[0, 0, 1, 0x65, 0xCC, 0xDD],
        ]
        .concat();

        let units = collect(&stream).await;
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].unit_type, NAL_TYPE_SPS);
        assert_eq!(units[0].data, vec![0x67, 0xAA]);
        assert_eq!(units[1].unit_type, NAL_TYPE_PPS);
        assert_eq!(units[2].unit_type, NAL_TYPE_IDR);
        assert_eq!(units[2].data, vec![0x65, 0xCC, 0xDD]);
    }

    #[tokio::test]
    async fn final_unit_is_emitted_at_end_of_stream() {
        let units = collect(&[0, 0, 0, 1, 0x41, 0x01, 0x02]).await;
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].unit_type, 1);
        assert_eq!(units[0].data, vec![0x41, 0x01, 0x02]);
    }

    #[tokio::test]
    async fn boundaries_do_not_depend_on_read_sizes() {
        // A reader that returns one byte at a time exercises every possible
        // split of the start code across reads.
        struct OneByte(Cursor<Vec<u8>>);
        impl tokio::io::AsyncRead for OneByte {
            fn poll_read(
                mut self: std::pin::Pin<&mut Self>,
                cx: &mut std::task::Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                let mut one = [0u8; 1];
                let mut small = tokio::io::ReadBuf::new(&mut one);
                match std::pin::Pin::new(&mut self.0).poll_read(cx, &mut small) {
                    std::task::Poll::Ready(Ok(())) => {
                        buf.put_slice(small.filled());
                        std::task::Poll::Ready(Ok(()))
                    }
                    other => other,
                }
            }
        }

        let stream = [
            &[0, 0, 0, 1, 0x67, 0xAA][..],
            &[0, 0, 1, 0x65, 0xCC],
            &[0, 0, 0, 1, 0x41, 0xDD],
        ]
        .concat();

        let mut reader = AnnexBReader::new(OneByte(Cursor::new(stream)));
        let mut units = Vec::new();
        while let Some(unit) = reader.next_unit().await.unwrap() {
            units.push(unit);
        }
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].data, vec![0x67, 0xAA]);
        assert_eq!(units[1].data, vec![0x65, 0xCC]);
        assert_eq!(units[2].data, vec![0x41, 0xDD]);
    }

    #[tokio::test]
    async fn stream_without_leading_start_code_is_rejected() {
        let mut reader = AnnexBReader::new(Cursor::new(vec![0x65, 0x01, 0x02, 0x03, 0x04]));
        assert!(matches!(
            reader.next_unit().await,
            Err(H264Error::MissingStartCode)
        ));
    }

    #[tokio::test]
    async fn empty_stream_yields_nothing() {
        let units = collect(&[]).await;
        assert!(units.is_empty());
    }

    #[tokio::test]
    async fn adjacent_start_codes_are_skipped() {
        let units = collect(&[0, 0, 0, 1, 0, 0, 1, 0x41, 0x07]).await;
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].data, vec![0x41, 0x07]);
    }

    #[test]
    fn unit_type_classification() {
        let sps = NalUnit { unit_type: NAL_TYPE_SPS, data: vec![0x67] };
        let pps = NalUnit { unit_type: NAL_TYPE_PPS, data: vec![0x68] };
        let idr = NalUnit { unit_type: NAL_TYPE_IDR, data: vec![0x65] };
        let slice = NalUnit { unit_type: 1, data: vec![0x41] };
        assert!(sps.is_parameter_set() && pps.is_parameter_set());
        assert!(!idr.is_parameter_set() && !slice.is_parameter_set());
        assert!(idr.is_idr() && !sps.is_idr());
    }
}
