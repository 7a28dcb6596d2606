//! Append-only hash-chained block file
//!
//! On disk the ledger is newline-delimited JSON. A line is either a
//! legacy v1 event (a bare hash-chained object, accepted only before the
//! first v2 line) or a v2 block `{header, data}`.
//!
//! Transactions accumulate into the open block until a flush trigger
//! (transaction count or byte threshold), at which point the block is
//! sealed: the Merkle root over the transactions' canonical digests
//! becomes `dataHash`, a 16-byte random nonce and the UTC timestamp are
//! stamped, `blockSize` is fixed to the serialized line's own byte length
//! (solved by iteration, since the field appears inside the line), and
//! `headerHash` seals the header. The line is appended and fsynced.
//!
//! Merkle construction: leaves pair left to right; an odd node count
//! duplicates the last node at each level. The boot verifier applies the
//! identical routine.
//!
//! On open the whole file is verified: every transaction hash and
//! `prevHash` link (including the v1→v2 bridge), every Merkle root,
//! header hash, height step, `prevHeaderHash` link, and every recorded
//! `blockSize` against the actual line length. The first offending line
//! is named in the error.

#![forbid(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rand::RngCore;
use tracing::{debug, info};

use crate::canonical::{self, CanonicalError};
use crate::model::{Block, BlockData, BlockHeader, BlockRef, Transaction, BLOCK_VERSION_V2};

/// Flush thresholds and file location for one zone's ledger.
#[derive(Debug, Clone)]
pub struct BlockStoreConfig {
    pub path: PathBuf,
    pub max_block_txs: usize,
    pub max_block_bytes: u64,
}

/// Errors raised while appending to or verifying a ledger file.
#[derive(Debug, thiserror::Error)]
pub enum BlockStoreError {
    #[error("ledger {}: {source}", .path.display())]
    Io { path: PathBuf, source: std::io::Error },
    #[error("ledger line {line}: invalid JSON: {source}")]
    Parse { line: usize, source: serde_json::Error },
    #[error("ledger line {line}: v1 event after the first v2 block")]
    V1AfterV2 { line: usize },
    #[error("ledger line {line}: v1 event missing hash/prevHash strings")]
    V1Fields { line: usize },
    #[error("ledger line {line}: transaction {index} hash mismatch")]
    TxHash { line: usize, index: usize },
    #[error("ledger line {line}: transaction {index} prevHash broken (expected {expected:?})")]
    TxChain { line: usize, index: usize, expected: String },
    #[error("ledger line {line}: block version {found:?}, expected \"v2\"")]
    Version { line: usize, found: String },
    #[error("ledger line {line}: merkle root mismatch")]
    Merkle { line: usize },
    #[error("ledger line {line}: header hash mismatch")]
    HeaderHash { line: usize },
    #[error("ledger line {line}: height {found}, expected {expected}")]
    Height { line: usize, found: i64, expected: i64 },
    #[error("ledger line {line}: prevHeaderHash broken (expected {expected:?})")]
    HeaderChain { line: usize, expected: String },
    #[error("ledger line {line}: blockSize {recorded} does not match line length {actual}")]
    BlockSize { line: usize, recorded: u64, actual: u64 },
    #[error("block size fixpoint did not converge")]
    Fixpoint,
    #[error(transparent)]
    Canonical(#[from] CanonicalError),
}

// ============================================================================
// Merkle root
// ============================================================================

/// Merkle root over leaf digests: pairwise SHA-256 of concatenated
/// children, duplicating the last node when a level is odd. Lowercase
/// hex. The empty set hashes to SHA-256 of no bytes.
pub fn merkle_root(leaves: &[[u8; 32]]) -> String {
    if leaves.is_empty() {
        return canonical::sha256_hex(b"");
    }
    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = *level.last().expect("non-empty level");
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                canonical::sha256_raw(&buf)
            })
            .collect();
    }
    hex::encode(level[0])
}

// ============================================================================
// Query index
// ============================================================================

/// One queryable ledger entry (a transaction, or a legacy v1 event), in
/// append order.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// The entry's own hash; doubles as its id.
    pub id: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    pub zone_id: Option<String>,
    pub epoch_index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_at: Option<String>,
    /// Height of the containing block; absent for v1 events.
    pub block_height: Option<i64>,
    pub value: serde_json::Value,
}

/// Filters for `GET /events`. Results preserve append order.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub entry_type: Option<String>,
    pub zone_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: usize,
    pub size: usize,
}

/// Apply filters and pagination over the append-ordered index.
pub fn query_entries(entries: &[LedgerEntry], q: &EventQuery) -> Vec<LedgerEntry> {
    let size = if q.size == 0 { 50 } else { q.size };
    entries
        .iter()
        .filter(|e| q.entry_type.as_ref().map_or(true, |t| &e.entry_type == t))
        .filter(|e| q.zone_id.as_ref().map_or(true, |z| e.zone_id.as_ref() == Some(z)))
        .filter(|e| match (&q.from, &e.matched_at) {
            (Some(from), Some(at)) => {
                canonical::parse_rfc3339(at).map(|t| t >= *from).unwrap_or(false)
            }
            (Some(_), None) => false,
            _ => true,
        })
        .filter(|e| match (&q.to, &e.matched_at) {
            (Some(to), Some(at)) => {
                canonical::parse_rfc3339(at).map(|t| t <= *to).unwrap_or(false)
            }
            (Some(_), None) => false,
            _ => true,
        })
        .skip(q.page * size)
        .take(size)
        .cloned()
        .collect()
}

fn entry_for_tx(tx: &Transaction, height: i64) -> LedgerEntry {
    LedgerEntry {
        id: tx.hash.clone(),
        entry_type: tx.tx_type.clone(),
        zone_id: Some(tx.zone_id.clone()),
        epoch_index: Some(tx.epoch_index),
        matched_at: Some(canonical::rfc3339_nano(&tx.matched_at)),
        block_height: Some(height),
        value: serde_json::to_value(tx).unwrap_or(serde_json::Value::Null),
    }
}

// ============================================================================
// File verification
// ============================================================================

/// Tail state and totals from a full-file verification pass.
#[derive(Debug)]
pub struct VerifySummary {
    pub lines: usize,
    pub v1_events: usize,
    pub blocks: usize,
    pub transactions: usize,
    /// Hash of the final transaction (or final v1 event), "" when empty.
    pub last_tx_hash: String,
    /// Height the next block must take.
    pub next_height: i64,
    /// Header hash the next block must link to ("" right after a v1
    /// prefix or on an empty file).
    pub prev_header_hash: String,
    pub entries: Vec<LedgerEntry>,
}

/// Stream `path`, re-deriving every hash and link. Any mismatch is fatal
/// and names the first offending line. A missing file verifies as empty.
pub fn verify_file(path: &Path) -> Result<VerifySummary, BlockStoreError> {
    let mut summary = VerifySummary {
        lines: 0,
        v1_events: 0,
        blocks: 0,
        transactions: 0,
        last_tx_hash: String::new(),
        next_height: 0,
        prev_header_hash: String::new(),
        entries: Vec::new(),
    };
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(summary),
        Err(source) => return Err(BlockStoreError::Io { path: path.to_path_buf(), source }),
    };

    let mut seen_v2 = false;
    let mut last_v1_index: i64 = -1;
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let lineno = idx + 1;
        let line =
            line.map_err(|source| BlockStoreError::Io { path: path.to_path_buf(), source })?;
        if line.trim().is_empty() {
            continue;
        }
        summary.lines += 1;
        let value: serde_json::Value = serde_json::from_str(&line)
            .map_err(|source| BlockStoreError::Parse { line: lineno, source })?;

        if value.get("header").is_some() {
            let block: Block = serde_json::from_value(value)
                .map_err(|source| BlockStoreError::Parse { line: lineno, source })?;
            verify_block(&block, &line, lineno, &mut summary, seen_v2, last_v1_index)?;
            if !seen_v2 {
                seen_v2 = true;
            }
            summary.blocks += 1;
        } else {
            if seen_v2 {
                return Err(BlockStoreError::V1AfterV2 { line: lineno });
            }
            verify_v1_event(&value, lineno, &mut summary)?;
            last_v1_index += 1;
            summary.v1_events += 1;
        }
    }
    if !seen_v2 {
        summary.next_height = last_v1_index + 1;
    }
    Ok(summary)
}

fn verify_v1_event(
    value: &serde_json::Value,
    lineno: usize,
    summary: &mut VerifySummary,
) -> Result<(), BlockStoreError> {
    let hash = value.get("hash").and_then(|v| v.as_str());
    let prev = value.get("prevHash").and_then(|v| v.as_str());
    let (hash, prev) = match (hash, prev) {
        (Some(h), Some(p)) => (h, p),
        _ => return Err(BlockStoreError::V1Fields { line: lineno }),
    };
    let mut without = value.clone();
    if let serde_json::Value::Object(map) = &mut without {
        map.remove("hash");
    }
    let recomputed = canonical::hash_canonical(&without)?;
    if recomputed != hash {
        return Err(BlockStoreError::TxHash { line: lineno, index: 0 });
    }
    if prev != summary.last_tx_hash {
        return Err(BlockStoreError::TxChain {
            line: lineno,
            index: 0,
            expected: summary.last_tx_hash.clone(),
        });
    }
    summary.last_tx_hash = hash.to_string();
    summary.entries.push(LedgerEntry {
        id: hash.to_string(),
        entry_type: value
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("v1.event")
            .to_string(),
        zone_id: value.get("zoneId").and_then(|v| v.as_str()).map(str::to_string),
        epoch_index: value.get("epochIndex").and_then(|v| v.as_i64()),
        matched_at: value.get("matchedAt").and_then(|v| v.as_str()).map(str::to_string),
        block_height: None,
        value: value.clone(),
    });
    Ok(())
}

fn verify_block(
    block: &Block,
    line: &str,
    lineno: usize,
    summary: &mut VerifySummary,
    seen_v2: bool,
    last_v1_index: i64,
) -> Result<(), BlockStoreError> {
    if block.header.version != BLOCK_VERSION_V2 {
        return Err(BlockStoreError::Version { line: lineno, found: block.header.version.clone() });
    }

    // Transactions: per-tx hash and the cross-file prevHash chain
    // (including the v1→v2 bridge on the first block after a prefix).
    let mut leaves: Vec<[u8; 32]> = Vec::with_capacity(block.data.transactions.len());
    for (i, tx) in block.data.transactions.iter().enumerate() {
        if tx.prev_hash != summary.last_tx_hash {
            return Err(BlockStoreError::TxChain {
                line: lineno,
                index: i,
                expected: summary.last_tx_hash.clone(),
            });
        }
        let recomputed = tx.compute_hash()?;
        if recomputed != tx.hash {
            return Err(BlockStoreError::TxHash { line: lineno, index: i });
        }
        summary.last_tx_hash = tx.hash.clone();
        leaves.push(tx.leaf_digest()?);
        summary.transactions += 1;
    }

    if merkle_root(&leaves) != block.header.data_hash {
        return Err(BlockStoreError::Merkle { line: lineno });
    }
    if block.header.compute_header_hash()? != block.header.header_hash {
        return Err(BlockStoreError::HeaderHash { line: lineno });
    }

    // Height and header linkage.
    let expected_height =
        if seen_v2 { summary.next_height } else { last_v1_index + 1 };
    if block.header.height != expected_height {
        return Err(BlockStoreError::Height {
            line: lineno,
            found: block.header.height,
            expected: expected_height,
        });
    }
    let expected_prev = if seen_v2 { summary.prev_header_hash.clone() } else { String::new() };
    if block.header.prev_header_hash != expected_prev {
        return Err(BlockStoreError::HeaderChain { line: lineno, expected: expected_prev });
    }

    let actual = line.as_bytes().len() as u64;
    if block.header.block_size != actual {
        return Err(BlockStoreError::BlockSize {
            line: lineno,
            recorded: block.header.block_size,
            actual,
        });
    }

    for tx in &block.data.transactions {
        summary.entries.push(entry_for_tx(tx, block.header.height));
    }
    summary.next_height = block.header.height + 1;
    summary.prev_header_hash = block.header.header_hash.clone();
    Ok(())
}

// ============================================================================
// Store
// ============================================================================

/// A flushed block's coordinates and contents, handed to the public
/// publisher hook.
pub struct FlushedBlock {
    pub height: i64,
    pub header_hash: String,
    pub data_hash: String,
    pub transactions: Vec<Transaction>,
}

impl FlushedBlock {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef {
            height: self.height,
            header_hash: self.header_hash.clone(),
            data_hash: self.data_hash.clone(),
        }
    }
}

/// The append-only block store for one zone. Verifies the existing file
/// on open, then extends the chain.
pub struct BlockStore {
    cfg: BlockStoreConfig,
    file: File,
    open_txs: Vec<Transaction>,
    open_bytes: u64,
    last_tx_hash: String,
    next_height: i64,
    prev_header_hash: String,
    index: Arc<RwLock<Vec<LedgerEntry>>>,
}

impl BlockStore {
    /// Open the store, verifying the whole existing file first. Any
    /// verification failure is fatal.
    pub fn open(cfg: BlockStoreConfig) -> Result<Self, BlockStoreError> {
        let summary = verify_file(&cfg.path)?;
        info!(
            path = %cfg.path.display(),
            blocks = summary.blocks,
            v1_events = summary.v1_events,
            transactions = summary.transactions,
            next_height = summary.next_height,
            "ledger verified"
        );
        if let Some(dir) = cfg.path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|source| BlockStoreError::Io { path: cfg.path.clone(), source })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.path)
            .map_err(|source| BlockStoreError::Io { path: cfg.path.clone(), source })?;
        Ok(BlockStore {
            cfg,
            file,
            open_txs: Vec::new(),
            open_bytes: 0,
            last_tx_hash: summary.last_tx_hash,
            next_height: summary.next_height,
            prev_header_hash: summary.prev_header_hash,
            index: Arc::new(RwLock::new(summary.entries)),
        })
    }

    /// Shared handle to the append-ordered query index.
    pub fn index(&self) -> Arc<RwLock<Vec<LedgerEntry>>> {
        Arc::clone(&self.index)
    }

    /// Hash of the chain tail (last appended transaction).
    pub fn last_tx_hash(&self) -> &str {
        &self.last_tx_hash
    }

    /// Chain a transaction onto the tail and stage it in the open block.
    /// `prevHash` and `hash` are assigned here so the chain invariant
    /// cannot be broken by callers. Returns the flushed block when this
    /// append tripped a flush trigger.
    pub fn append_transaction(
        &mut self,
        mut tx: Transaction,
        now: DateTime<Utc>,
    ) -> Result<Option<FlushedBlock>, BlockStoreError> {
        tx.prev_hash = self.last_tx_hash.clone();
        tx.hash = tx.compute_hash()?;
        self.last_tx_hash = tx.hash.clone();
        self.open_bytes += canonical::to_canonical_json(&tx)?.len() as u64;
        self.open_txs.push(tx);

        if self.open_txs.len() >= self.cfg.max_block_txs || self.open_bytes >= self.cfg.max_block_bytes
        {
            return self.flush_block(now);
        }
        Ok(None)
    }

    /// Seal and append the open block, if it holds any transactions.
    pub fn flush_block(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Option<FlushedBlock>, BlockStoreError> {
        if self.open_txs.is_empty() {
            return Ok(None);
        }
        let txs = std::mem::take(&mut self.open_txs);
        self.open_bytes = 0;

        let leaves: Vec<[u8; 32]> =
            txs.iter().map(|tx| tx.leaf_digest()).collect::<Result<_, _>>()?;
        let data_hash = merkle_root(&leaves);
        let mut nonce = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut block = Block {
            header: BlockHeader {
                version: BLOCK_VERSION_V2.to_string(),
                height: self.next_height,
                prev_header_hash: self.prev_header_hash.clone(),
                data_hash: data_hash.clone(),
                timestamp: now,
                block_size: 0,
                nonce: hex::encode(nonce),
                header_hash: String::new(),
            },
            data: BlockData { transactions: txs },
        };

        // blockSize names the serialized line's own length; solve by
        // iteration (the digit width stabilizes within a few rounds).
        let mut line = String::new();
        let mut settled = false;
        for _ in 0..8 {
            block.header.header_hash = block.header.compute_header_hash()?;
            line = canonical::to_canonical_json(&block)?;
            let actual = line.as_bytes().len() as u64;
            if actual == block.header.block_size {
                settled = true;
                break;
            }
            block.header.block_size = actual;
        }
        if !settled {
            return Err(BlockStoreError::Fixpoint);
        }

        let io = |source| BlockStoreError::Io { path: self.cfg.path.clone(), source };
        self.file.write_all(line.as_bytes()).map_err(io)?;
        self.file.write_all(b"\n").map_err(io)?;
        self.file.sync_all().map_err(io)?;

        let flushed = FlushedBlock {
            height: block.header.height,
            header_hash: block.header.header_hash.clone(),
            data_hash,
            transactions: block.data.transactions.clone(),
        };
        {
            let mut index = self.index.write().unwrap();
            for tx in &flushed.transactions {
                index.push(entry_for_tx(tx, flushed.height));
            }
        }
        self.next_height += 1;
        self.prev_header_hash = block.header.header_hash.clone();
        debug!(
            path = %self.cfg.path.display(),
            height = flushed.height,
            txs = flushed.transactions.len(),
            "block flushed"
        );
        Ok(Some(flushed))
    }
}

// ============================================================================
// Tests
// ============================================================================
