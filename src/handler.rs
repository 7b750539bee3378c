// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-table event transforms.
//!
//! Handlers are a closed set of variants chosen at registration time from
//! a configuration string:
//!
//! | Spec | Behavior |
//! |------|----------|
//! | `passthrough` | Identity. Inserts and updates become upserts. |
//! | `shard(key=id, nr=1, count=4, hash=sha256)` | Keep rows owned by shard `nr`. |
//! | `obfuscate(keep=id\|email, salt=s3)` | Mask every other non-key column. |
//! | `merge(version=updated_at)` | Upsert-by-key from several providers. |
//!
//! The same handler runs on both paths (live events and bulk-copied rows)
//! so copied and replayed data are indistinguishable by value.
//! Handlers never write anything themselves; they only decide what
//! operation, if any, reaches the apply step.

use crate::error::{ReplicationError, Result};
use crate::event::{Event, Op, Row};
use crate::store::TableInfo;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Operation staged for the apply step.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOp {
    /// Insert or overwrite by primary key.
    Upsert {
        row: Row,
        /// Only overwrite when the incoming value of this column is not older.
        version_column: Option<String>,
    },
    /// Delete by primary key.
    Delete { key: Row },
    /// Remove every row of the table.
    Truncate,
}

/// Hash function used to place a row on a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashFunc {
    /// First eight bytes of SHA-256 of the key's text form.
    Sha256,
    /// The integer key itself.
    Int,
}

impl std::str::FromStr for HashFunc {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sha256" => Ok(Self::Sha256),
            "int" => Ok(Self::Int),
            other => Err(ReplicationError::Config(format!("unknown hash function: {}", other))),
        }
    }
}

impl HashFunc {
    /// Hash a key value. `None` for null or non-hashable values.
    pub fn hash(&self, value: &Value) -> Option<u64> {
        match self {
            HashFunc::Sha256 => {
                let text = match value {
                    Value::Null => return None,
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let digest = Sha256::digest(text.as_bytes());
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&digest[..8]);
                Some(u64::from_be_bytes(bytes))
            }
            HashFunc::Int => match value {
                Value::Number(n) => n.as_i64().map(|v| v as u64).or_else(|| n.as_u64()),
                Value::String(s) => s.trim().parse::<i64>().ok().map(|v| v as u64),
                _ => None,
            },
        }
    }
}

/// Power-of-two row partitioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardConfig {
    pub shard_nr: u64,
    pub shard_mask: u64,
    pub shard_count: u64,
    pub hash_func: HashFunc,
}

impl ShardConfig {
    pub fn new(shard_nr: u64, shard_count: u64, hash_func: HashFunc) -> Result<Self> {
        let config = Self {
            shard_nr,
            shard_mask: shard_count.wrapping_sub(1),
            shard_count,
            hash_func,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 || !self.shard_count.is_power_of_two() {
            return Err(ReplicationError::Config(format!(
                "shard count {} is not a power of two",
                self.shard_count
            )));
        }
        if self.shard_mask.wrapping_add(1) != self.shard_count {
            return Err(ReplicationError::Config(format!(
                "shard mask {} does not match count {}",
                self.shard_mask, self.shard_count
            )));
        }
        if self.shard_nr > self.shard_mask {
            return Err(ReplicationError::Config(format!(
                "shard nr {} out of range for mask {}",
                self.shard_nr, self.shard_mask
            )));
        }
        Ok(())
    }

    /// Whether the hashed key lands on this shard.
    pub fn owns_hash(&self, hash: u64) -> bool {
        hash & self.shard_mask == self.shard_nr
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShardHandler {
    pub key: String,
    pub shard: ShardConfig,
}

impl ShardHandler {
    fn owns(&self, table: &str, row: &Row) -> Result<bool> {
        let value = row.get(&self.key).ok_or_else(|| {
            ReplicationError::handler(table, format!("shard key {} missing from row", self.key))
        })?;
        let hash = self.shard.hash_func.hash(value).ok_or_else(|| {
            ReplicationError::handler(table, format!("shard key {} is not hashable: {}", self.key, value))
        })?;
        Ok(self.shard.owns_hash(hash))
    }
}

/// Text a value is hashed as.
///
/// SQLite may return `"42"` for a number captured into a TEXT column, `1`
/// for `true`, or `2.0` for `2` from a REAL column; each pair shares a form.
pub(crate) fn canonical_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => Some((f as i64).to_string()),
            _ => Some(n.to_string()),
        },
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObfuscateHandler {
    pub keep: BTreeSet<String>,
    pub salt: String,
}

impl ObfuscateHandler {
    fn digest(&self, column: &str, text: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update([0u8]);
        hasher.update(column.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        hasher.finalize().into()
    }

    /// Salted hash of the value's text form as a signed integer; NULL stays NULL.
    ///
    /// Every type hashes through [`canonical_text`], so a value keeps its
    /// mask whichever way storage hands it back.
    pub fn mask_value(&self, column: &str, value: &Value) -> Value {
        let Some(text) = canonical_text(value) else {
            return Value::Null;
        };
        let digest = self.digest(column, &text);
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Value::from(i64::from_be_bytes(bytes))
    }

    pub fn mask_row(&self, row: Row, info: &TableInfo) -> Row {
        row.into_iter()
            .map(|(col, value)| {
                if self.keep.contains(&col) || info.is_key(&col) {
                    (col, value)
                } else {
                    let masked = self.mask_value(&col, &value);
                    (col, masked)
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeHandler {
    pub version_column: Option<String>,
}

/// Table handler.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Handler {
    #[default]
    Passthrough,
    Shard(ShardHandler),
    Obfuscate(ObfuscateHandler),
    Merge(MergeHandler),
}

/// Split `name(k=v, k=v)` into its name and arguments.
fn parse_spec(spec: &str) -> Result<(String, BTreeMap<String, String>)> {
    let spec = spec.trim();
    let Some(open) = spec.find('(') else {
        return Ok((spec.to_string(), BTreeMap::new()));
    };
    if !spec.ends_with(')') {
        return Err(ReplicationError::Config(format!("unbalanced handler spec: {}", spec)));
    }
    let name = spec[..open].trim().to_string();
    let body = &spec[open + 1..spec.len() - 1];
    let mut args = BTreeMap::new();
    for part in body.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (k, v) = part.split_once('=').ok_or_else(|| {
            ReplicationError::Config(format!("handler argument without value: {}", part))
        })?;
        if args.insert(k.trim().to_string(), v.trim().to_string()).is_some() {
            return Err(ReplicationError::Config(format!("duplicate handler argument: {}", k.trim())));
        }
    }
    Ok((name, args))
}

fn take_u64(args: &mut BTreeMap<String, String>, key: &str) -> Result<Option<u64>> {
    args.remove(key)
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| ReplicationError::Config(format!("{} must be an integer, got {}", key, v)))
        })
        .transpose()
}

fn reject_leftovers(name: &str, args: BTreeMap<String, String>) -> Result<()> {
    match args.keys().next() {
        Some(k) => Err(ReplicationError::Config(format!("unknown argument {} for handler {}", k, name))),
        None => Ok(()),
    }
}

impl Handler {
    /// Parse a handler specification string.
    pub fn parse(spec: &str) -> Result<Self> {
        let (name, mut args) = parse_spec(spec)?;
        let handler = match name.as_str() {
            "" | "passthrough" => Handler::Passthrough,
            "shard" => {
                let key = args
                    .remove("key")
                    .ok_or_else(|| ReplicationError::Config("shard handler needs key=".to_string()))?;
                let nr = take_u64(&mut args, "nr")?
                    .ok_or_else(|| ReplicationError::Config("shard handler needs nr=".to_string()))?;
                let count = take_u64(&mut args, "count")?
                    .ok_or_else(|| ReplicationError::Config("shard handler needs count=".to_string()))?;
                let hash_func = match args.remove("hash") {
                    Some(h) => h.parse()?,
                    None => HashFunc::Sha256,
                };
                let mut shard = ShardConfig::new(nr, count, hash_func)?;
                if let Some(mask) = take_u64(&mut args, "mask")? {
                    shard.shard_mask = mask;
                    shard.validate()?;
                }
                Handler::Shard(ShardHandler { key, shard })
            }
            "obfuscate" => {
                let keep = args
                    .remove("keep")
                    .map(|k| {
                        k.split('|')
                            .map(str::trim)
                            .filter(|c| !c.is_empty())
                            .map(String::from)
                            .collect()
                    })
                    .unwrap_or_default();
                let salt = args.remove("salt").unwrap_or_default();
                Handler::Obfuscate(ObfuscateHandler { keep, salt })
            }
            "merge" => Handler::Merge(MergeHandler {
                version_column: args.remove("version"),
            }),
            other => {
                return Err(ReplicationError::Config(format!("unknown handler: {}", other)));
            }
        };
        reject_leftovers(&name, args)?;
        Ok(handler)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Handler::Passthrough => "passthrough",
            Handler::Shard(_) => "shard",
            Handler::Obfuscate(_) => "obfuscate",
            Handler::Merge(_) => "merge",
        }
    }

    /// Whether a bulk copy may empty the target table first.
    pub fn truncates_on_copy(&self) -> bool {
        !matches!(self, Handler::Merge(_))
    }

    /// Transform a live event into the operation to apply.
    ///
    /// `Ok(None)` drops the event. Errors are fatal for the table only.
    pub fn transform(&self, event: &Event, info: &TableInfo) -> Result<Option<ApplyOp>> {
        let row = event.row.clone();
        match self {
            Handler::Passthrough => Ok(basic_op(event.op, row, None)),
            Handler::Shard(shard) => match event.op {
                Op::Insert | Op::Update | Op::Delete => {
                    if shard.owns(&event.table, &event.row)? {
                        Ok(basic_op(event.op, row, None))
                    } else {
                        Ok(None)
                    }
                }
                _ => Ok(basic_op(event.op, row, None)),
            },
            Handler::Obfuscate(ob) => Ok(basic_op(event.op, ob.mask_row(row, info), None)),
            Handler::Merge(merge) => match event.op {
                // Other providers still own rows in the shared table.
                Op::Truncate => Ok(None),
                _ => Ok(basic_op(event.op, row, merge.version_column.clone())),
            },
        }
    }

    /// Transform one bulk-copied row. `Ok(None)` leaves it out.
    pub fn copy_row(&self, table: &str, row: Row, info: &TableInfo) -> Result<Option<Row>> {
        match self {
            Handler::Passthrough | Handler::Merge(_) => Ok(Some(row)),
            Handler::Shard(shard) => {
                if shard.owns(table, &row)? {
                    Ok(Some(row))
                } else {
                    Ok(None)
                }
            }
            Handler::Obfuscate(ob) => Ok(Some(ob.mask_row(row, info))),
        }
    }

    /// Version guard used when bulk-copied rows are upserted.
    pub fn version_column(&self) -> Option<&str> {
        match self {
            Handler::Merge(m) => m.version_column.as_deref(),
            _ => None,
        }
    }
}

fn basic_op(op: Op, row: Row, version_column: Option<String>) -> Option<ApplyOp> {
    match op {
        Op::Insert | Op::Update => Some(ApplyOp::Upsert { row, version_column }),
        Op::Delete => Some(ApplyOp::Delete { key: row }),
        Op::Truncate => Some(ApplyOp::Truncate),
        Op::Execute => None,
    }
}
