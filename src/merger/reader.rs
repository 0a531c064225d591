//! Streaming reader over an ordered set of one-block payloads.
//!
//! A background producer resolves each file's payload in order and hands it
//! through a capacity-1 channel. The consumer side exposes a sequential byte
//! stream: the first payload is emitted verbatim, every later payload has its
//! leading codec header stripped, so the concatenation carries exactly one
//! header and can be copied blindly into the destination store.

use eyre::{bail, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::bundle::OneBlockFile;
use crate::codec;
use crate::merger::io::MergerIo;

/// Outcome of a single `read` call.
///
/// `Read(0)` means the call made no progress but the stream is not done;
/// callers should only stop on `Eof` or `Cancelled`.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadStatus {
    Read(usize),
    Eof,
    Cancelled,
}

pub struct BundleReader {
    data_rx: mpsc::Receiver<Vec<u8>>,
    err_rx: mpsc::Receiver<eyre::Report>,
    shutdown_rx: watch::Receiver<bool>,
    read_buffer: Option<Vec<u8>>,
    read_offset: usize,
    header_passed: bool,
}

enum Filled {
    Buffer(Vec<u8>, usize),
    Eof,
    Cancelled,
}

impl BundleReader {
    pub fn new(
        io: Arc<dyn MergerIo>,
        files: Vec<Arc<OneBlockFile>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let (data_tx, data_rx) = mpsc::channel(1);
        let (err_tx, err_rx) = mpsc::channel(1);
        tokio::spawn(async move {
            for file in files {
                match file.data(io.as_ref()).await {
                    Ok(data) => {
                        if data_tx.send(data).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = err_tx.send(err).await;
                        return;
                    }
                }
            }
        });
        Self {
            data_rx,
            err_rx,
            shutdown_rx,
            read_buffer: None,
            read_offset: 0,
            header_passed: false,
        }
    }

    pub async fn read(&mut self, out: &mut [u8]) -> Result<ReadStatus> {
        if self.read_buffer.is_none() {
            match self.fill_buffer().await? {
                Filled::Buffer(data, offset) => {
                    self.read_buffer = Some(data);
                    self.read_offset = offset;
                }
                Filled::Eof => return Ok(ReadStatus::Eof),
                Filled::Cancelled => return Ok(ReadStatus::Cancelled),
            }
        }

        let Some(buffer) = self.read_buffer.as_ref() else {
            return Ok(ReadStatus::Read(0));
        };
        let remaining = &buffer[self.read_offset..];
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        self.read_offset += n;
        if self.read_offset >= buffer.len() {
            self.read_buffer = None;
        }
        Ok(ReadStatus::Read(n))
    }

    async fn fill_buffer(&mut self) -> Result<Filled> {
        let Self {
            data_rx,
            err_rx,
            shutdown_rx,
            ..
        } = self;

        let maybe_data = loop {
            if *shutdown_rx.borrow() {
                return Ok(Filled::Cancelled);
            }
            tokio::select! {
                maybe = data_rx.recv() => break maybe,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break data_rx.recv().await;
                    }
                }
            }
        };

        let Some(data) = maybe_data else {
            // The producer sends its error before dropping the data channel,
            // so a pending error is always visible here.
            if let Ok(err) = err_rx.try_recv() {
                return Err(err);
            }
            return Ok(Filled::Eof);
        };

        if data.is_empty() {
            bail!("one-block file corrupt: empty payload");
        }
        if !self.header_passed {
            self.header_passed = true;
            return Ok(Filled::Buffer(data, 0));
        }
        if data.len() < codec::HEADER_LEN {
            bail!(
                "one-block file corrupt: expected header of {} bytes, payload is only {} bytes",
                codec::HEADER_LEN,
                data.len()
            );
        }
        Ok(Filled::Buffer(data, codec::HEADER_LEN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::block_file;
    use async_trait::async_trait;
    use std::collections::HashMap;

    struct PayloadIo {
        payloads: HashMap<u64, Vec<u8>>,
    }

    impl PayloadIo {
        fn new(payloads: Vec<(u64, Vec<u8>)>) -> Arc<Self> {
            Arc::new(Self {
                payloads: payloads.into_iter().collect(),
            })
        }
    }

    #[async_trait]
    impl MergerIo for PayloadIo {
        async fn walk_one_block_files(&self, _limit: usize) -> Result<Vec<Arc<OneBlockFile>>> {
            Ok(Vec::new())
        }

        async fn download_one_block_file(&self, file: &OneBlockFile) -> Result<Vec<u8>> {
            self.payloads
                .get(&file.block_num)
                .cloned()
                .ok_or_else(|| eyre::eyre!("no payload for block {}", file.block_num))
        }

        async fn fetch_merged_one_block_files(
            &self,
            _low_block_num: u64,
        ) -> Result<Option<Vec<Arc<OneBlockFile>>>> {
            Ok(None)
        }

        async fn merge_and_store(
            &self,
            _low_block_num: u64,
            _files: &[Arc<OneBlockFile>],
        ) -> Result<()> {
            Ok(())
        }

        async fn find_start_block(&self) -> Result<u64> {
            Ok(0)
        }
    }

    fn payload(header_fill: u8, body: &[u8]) -> Vec<u8> {
        let mut data = vec![header_fill; codec::HEADER_LEN];
        data.extend_from_slice(body);
        data
    }

    async fn read_all(reader: &mut BundleReader, chunk_size: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = vec![0u8; chunk_size];
        loop {
            match reader.read(&mut chunk).await? {
                ReadStatus::Read(n) => out.extend_from_slice(&chunk[..n]),
                ReadStatus::Eof => return Ok(out),
                ReadStatus::Cancelled => bail!("unexpected cancellation"),
            }
        }
    }

    fn files(nums: &[u64]) -> Vec<Arc<OneBlockFile>> {
        nums.iter()
            .map(|num| {
                block_file(
                    *num,
                    &format!("{num:08}a"),
                    &format!("{:08}a", num - 1),
                    0,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn strips_every_header_but_the_first() {
        let io = PayloadIo::new(vec![
            (1, payload(0xaa, b"first")),
            (2, payload(0xbb, b"second")),
            (3, payload(0xcc, b"third")),
        ]);
        let (_tx, shutdown_rx) = watch::channel(false);
        let mut reader = BundleReader::new(io, files(&[1, 2, 3]), shutdown_rx);

        let out = read_all(&mut reader, 7).await.expect("read");
        let mut expected = payload(0xaa, b"first");
        expected.extend_from_slice(b"second");
        expected.extend_from_slice(b"third");
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn emitted_length_matches_stripped_payloads() {
        let payloads = vec![
            (1, payload(0x00, &[1u8; 33])),
            (2, payload(0x00, &[2u8; 5])),
            (3, payload(0x00, &[3u8; 61])),
        ];
        let total: usize = payloads
            .iter()
            .enumerate()
            .map(|(idx, (_, data))| {
                if idx == 0 {
                    data.len()
                } else {
                    data.len() - codec::HEADER_LEN
                }
            })
            .sum();
        let io = PayloadIo::new(payloads);
        let (_tx, shutdown_rx) = watch::channel(false);
        let mut reader = BundleReader::new(io, files(&[1, 2, 3]), shutdown_rx);

        let out = read_all(&mut reader, 16).await.expect("read");
        assert_eq!(out.len(), total);
    }

    #[tokio::test]
    async fn empty_payload_is_corruption() {
        let io = PayloadIo::new(vec![(1, payload(0x00, b"ok")), (2, Vec::new())]);
        let (_tx, shutdown_rx) = watch::channel(false);
        let mut reader = BundleReader::new(io, files(&[1, 2]), shutdown_rx);

        let err = read_all(&mut reader, 64).await.expect_err("corrupt");
        assert!(err.to_string().contains("empty payload"), "{err}");
    }

    #[tokio::test]
    async fn short_follow_up_payload_is_corruption() {
        let io = PayloadIo::new(vec![(1, payload(0x00, b"ok")), (2, vec![0u8; 3])]);
        let (_tx, shutdown_rx) = watch::channel(false);
        let mut reader = BundleReader::new(io, files(&[1, 2]), shutdown_rx);

        let err = read_all(&mut reader, 64).await.expect_err("corrupt");
        assert!(err.to_string().contains("only 3 bytes"), "{err}");
    }

    #[tokio::test]
    async fn download_error_propagates() {
        let io = PayloadIo::new(vec![(1, payload(0x00, b"ok"))]);
        let (_tx, shutdown_rx) = watch::channel(false);
        let mut reader = BundleReader::new(io, files(&[1, 2]), shutdown_rx);

        let err = read_all(&mut reader, 64).await.expect_err("missing block");
        assert!(err.to_string().contains("no payload for block 2"), "{err}");
    }

    #[tokio::test]
    async fn cancellation_returns_cleanly() {
        let io = PayloadIo::new(vec![(1, payload(0x00, b"ok"))]);
        let (tx, shutdown_rx) = watch::channel(false);
        let mut reader = BundleReader::new(io, files(&[1]), shutdown_rx);
        tx.send(true).expect("signal shutdown");

        let mut chunk = [0u8; 8];
        assert_eq!(
            reader.read(&mut chunk).await.expect("read"),
            ReadStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn end_of_stream_is_eof() {
        let io = PayloadIo::new(vec![(1, payload(0x00, b"ok"))]);
        let (_tx, shutdown_rx) = watch::channel(false);
        let mut reader = BundleReader::new(io, files(&[1]), shutdown_rx);

        read_all(&mut reader, 64).await.expect("drain");
        let mut chunk = [0u8; 8];
        assert_eq!(reader.read(&mut chunk).await.expect("read"), ReadStatus::Eof);
    }
}
