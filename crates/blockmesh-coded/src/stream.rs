//! Streaming blob I/O.

use blockmesh_config::log_coded_debug;
use blockmesh_store::BlockSource;
use futures::stream::{self, Stream};
use tracing::instrument;

use crate::file::File;
use crate::{
    CodedError, KeyChain, Result, BLOCK_DATA, FIRST_BLOCK_DATA, LENGTH_PREFIX, MAX_BLOB_LEN,
};

/// Split logical block 0 into the declared blob length and its data.
pub(crate) fn read_length_prefix(payload: &[u8]) -> Result<(u64, &[u8])> {
    let Some((prefix, data)) = payload.split_first_chunk::<LENGTH_PREFIX>() else {
        return Err(CodedError::InvalidBlockFormat {
            reason: format!("first block payload is {} bytes, no length prefix", payload.len()),
        });
    };
    let length = u64::from(u32::from_le_bytes(*prefix));
    if data.len() as u64 > length {
        return Err(CodedError::InvalidBlockFormat {
            reason: format!("first block carries {} bytes of a {} byte blob", data.len(), length),
        });
    }
    Ok((length, data))
}

/// Logical block 0, cut but not yet written.
struct HeldFirst {
    keys: Vec<String>,
    data: Vec<u8>,
}

/// Streaming writer for one blob.
///
/// Bytes are buffered until a whole logical block is available. Logical
/// block 0 is held back until [`finish`](Self::finish), because it carries
/// the total length. After an error the writer must be discarded; blocks
/// already written stay behind until the blob is rewritten or deleted.
pub struct BlobWriter<'a, S> {
    file: File<'a, S>,
    keys: KeyChain,
    buffer: Vec<u8>,
    first: Option<HeldFirst>,
    length: u64,
    next_logical: u64,
}

impl<'a, S: BlockSource> BlobWriter<'a, S> {
    pub(crate) fn new(file: File<'a, S>) -> Self {
        let keys = KeyChain::new(file.name());
        Self {
            file,
            keys,
            buffer: Vec::new(),
            first: None,
            length: 0,
            next_logical: 0,
        }
    }

    /// Bytes accepted so far.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn reserve_logical(&mut self) -> Vec<String> {
        self.next_logical += 1;
        self.keys.take_keys(self.file.store().num_replicas())
    }

    /// Append `data`.
    ///
    /// Returns how many logical blocks this call flushed to the backing
    /// store; the future resolves once those writes have landed. A non-zero
    /// return is the signal to pace further input.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let length = self.length + data.len() as u64;
        if length > MAX_BLOB_LEN {
            return Err(CodedError::BlobTooLarge {
                len: length,
                max: MAX_BLOB_LEN,
            });
        }
        self.length = length;
        self.buffer.extend_from_slice(data);

        if self.first.is_none() && self.buffer.len() >= FIRST_BLOCK_DATA {
            let keys = self.reserve_logical();
            let data = self.buffer.drain(..FIRST_BLOCK_DATA).collect();
            self.first = Some(HeldFirst { keys, data });
        }
        if self.first.is_none() {
            return Ok(0);
        }

        let mut cut = 0;
        let mut flushed = 0;
        while self.buffer.len() - cut >= BLOCK_DATA {
            let keys = self.reserve_logical();
            let store = self.file.store();
            store
                .write_replicas(self.file.name(), &keys, &self.buffer[cut..cut + BLOCK_DATA])
                .await?;
            cut += BLOCK_DATA;
            flushed += 1;
        }
        self.buffer.drain(..cut);
        Ok(flushed)
    }

    /// Flush the tail and write logical block 0. Resolves with the blob
    /// length once block 0 has landed.
    #[instrument(skip(self), fields(name = %self.file.name(), len = self.length), level = "debug")]
    pub async fn finish(mut self) -> Result<u64> {
        let store = self.file.store();
        let first = match self.first.take() {
            Some(first) => {
                if !self.buffer.is_empty() {
                    // The tail gets a single copy at the first slot of its
                    // logical block
                    let keys = self.reserve_logical();
                    store
                        .write_replicas(self.file.name(), &keys[..1], &self.buffer)
                        .await?;
                }
                first
            }
            None => HeldFirst {
                keys: self.reserve_logical(),
                data: std::mem::take(&mut self.buffer),
            },
        };

        let mut payload = Vec::with_capacity(LENGTH_PREFIX + first.data.len());
        // length <= MAX_BLOB_LEN is checked on every write
        payload.extend_from_slice(&(self.length as u32).to_le_bytes());
        payload.extend_from_slice(&first.data);
        store
            .write_replicas(self.file.name(), &first.keys, &payload)
            .await?;
        log_coded_debug!(
            "Finished blob",
            name = self.file.name(),
            len = self.length,
            logical_blocks = self.next_logical
        );
        Ok(self.length)
    }
}

/// Streaming reader for one blob.
pub struct BlobReader<'a, S> {
    file: File<'a, S>,
    keys: KeyChain,
    length: u64,
    pos: u64,
    next_logical: u64,
    pending: Option<Vec<u8>>,
}

impl<'a, S: BlockSource> BlobReader<'a, S> {
    pub(crate) async fn open(file: File<'a, S>) -> Result<Self> {
        let mut keys = KeyChain::new(file.name());
        let first = file.store().fetch_logical(file.name(), &mut keys, 0).await?;
        let (length, data) = read_length_prefix(&first)?;
        Ok(Self {
            pos: data.len() as u64,
            pending: (!data.is_empty()).then(|| data.to_vec()),
            file,
            keys,
            length,
            next_logical: 1,
        })
    }

    /// Declared blob length.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Next chunk of data (one logical block's worth), or `None` at the end.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(data) = self.pending.take() {
            return Ok(Some(data));
        }
        if self.pos >= self.length {
            return Ok(None);
        }

        let logical = self.next_logical;
        let data = self
            .file
            .store()
            .fetch_logical(self.file.name(), &mut self.keys, logical)
            .await?;
        self.next_logical += 1;

        if data.is_empty() {
            return Err(CodedError::TruncatedBlob {
                expected: self.length,
                actual: self.pos,
            });
        }
        if self.pos + data.len() as u64 > self.length {
            return Err(CodedError::InvalidBlockFormat {
                reason: format!(
                    "logical block {} overruns the declared length {}",
                    logical, self.length
                ),
            });
        }
        self.pos += data.len() as u64;
        Ok(Some(data))
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<u8>>> + 'a
    where
        S: 'a,
    {
        stream::try_unfold(self, |mut reader| async move {
            let chunk = reader.next_chunk().await?;
            Ok::<_, CodedError>(chunk.map(|chunk| (chunk, reader)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodedBlockStore, CodedOptions};
    use blockmesh_store::{Result as StoreResult, StoreError};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory backing store.
    #[derive(Default)]
    struct MemStore {
        blocks: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl BlockSource for MemStore {
        async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
            self.blocks.lock().unwrap().get(key).cloned().ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
        }

        async fn store(&self, key: &str, block: &[u8]) -> StoreResult<i64> {
            let old = self.blocks.lock().unwrap().insert(key.to_string(), block.to_vec());
            Ok(block.len() as i64 - old.map_or(0, |b| b.len() as i64))
        }

        async fn remove(&self, key: &str) -> StoreResult<()> {
            self.blocks
                .lock()
                .unwrap()
                .remove(key)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound {
                    key: key.to_string(),
                })
        }
    }

    fn coded(replicas: usize) -> CodedBlockStore<MemStore> {
        CodedBlockStore::new(MemStore::default(), CodedOptions::default().with_replicas(replicas)).unwrap()
    }

    #[test]
    fn test_length_prefix() {
        let mut payload = 5u32.to_le_bytes().to_vec();
        payload.extend_from_slice(b"hello");
        let (len, data) = read_length_prefix(&payload).unwrap();
        assert_eq!(len, 5);
        assert_eq!(data, b"hello");

        assert!(read_length_prefix(&[1, 0]).is_err());
        // More data than declared
        let mut overrun = 2u32.to_le_bytes().to_vec();
        overrun.extend_from_slice(b"abc");
        assert!(matches!(read_length_prefix(&overrun), Err(CodedError::InvalidBlockFormat { .. })));
    }

    #[tokio::test]
    async fn test_first_block_held_until_finish() {
        let store = coded(2);
        let file = store.file("held");
        let mut writer = file.write_stream();

        assert_eq!(writer.write(&vec![1u8; FIRST_BLOCK_DATA]).await.unwrap(), 0);
        assert!(store.backing().blocks.lock().unwrap().is_empty());

        // One full later block is flushed to both replicas
        assert_eq!(writer.write(&vec![2u8; BLOCK_DATA]).await.unwrap(), 1);
        assert_eq!(store.backing().blocks.lock().unwrap().len(), 2);

        assert_eq!(writer.finish().await.unwrap(), (FIRST_BLOCK_DATA + BLOCK_DATA) as u64);
        assert_eq!(store.backing().blocks.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_tail_gets_single_copy() {
        let store = coded(3);
        let file = store.file("tail");
        let mut writer = file.write_stream();
        writer.write(&vec![0u8; FIRST_BLOCK_DATA + 10]).await.unwrap();
        writer.finish().await.unwrap();

        let keys = KeyChain::new("tail").take_keys(6);
        let blocks = store.backing().blocks.lock().unwrap();
        assert!(keys[..3].iter().all(|k| blocks.contains_key(k)));
        assert!(blocks.contains_key(&keys[3]));
        assert!(!blocks.contains_key(&keys[4]));
        assert!(!blocks.contains_key(&keys[5]));
    }

    #[tokio::test]
    async fn test_blob_too_large() {
        let store = coded(1);
        let file = store.file("big");
        let mut writer = file.write_stream();
        writer.length = MAX_BLOB_LEN;
        let err = writer.write(b"x").await.unwrap_err();
        assert!(matches!(err, CodedError::BlobTooLarge { len, .. } if len == MAX_BLOB_LEN + 1));
        assert_eq!(writer.len(), MAX_BLOB_LEN);
    }

    #[tokio::test]
    async fn test_empty_later_block_is_truncation() {
        let store = coded(1);
        let sealer = crate::BlockSealer::new(crate::DEFAULT_SECRET).unwrap();
        let keys = KeyChain::new("cut").take_keys(2);

        // Declares 20000 bytes but the second block is empty
        let mut first = 20000u32.to_le_bytes().to_vec();
        first.extend_from_slice(&vec![0u8; FIRST_BLOCK_DATA]);
        {
            let mut blocks = store.backing().blocks.lock().unwrap();
            blocks.insert(keys[0].clone(), sealer.seal("cut", &keys[0], &first));
            blocks.insert(keys[1].clone(), sealer.seal("cut", &keys[1], b""));
        }

        let mut reader = store.file("cut").read_stream().await.unwrap();
        assert_eq!(reader.len(), 20000);
        assert!(reader.next_chunk().await.unwrap().is_some());
        assert!(matches!(
            reader.next_chunk().await,
            Err(CodedError::TruncatedBlob { expected: 20000, actual }) if actual == FIRST_BLOCK_DATA as u64
        ));
    }

    #[tokio::test]
    async fn test_into_stream_yields_all_chunks() {
        use futures::TryStreamExt;

        let store = coded(1);
        let file = store.file("s");
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        let mut writer = file.write_stream();
        writer.write(&data).await.unwrap();
        writer.finish().await.unwrap();

        let chunks: Vec<Vec<u8>> = file.read_stream().await.unwrap().into_stream().try_collect().await.unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), data);
    }
}
