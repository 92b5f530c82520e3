//! Storage engine of the reference daemon. Fixture-grade semantics: a
//! per-table memtable in front of immutable bincode sstables, a single
//! commitlog for durability, and uniform hash placement of flushed rows
//! across data directories. Tombstones are prefix-scoped and retained
//! through compaction (the fixture never expires them).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::error::{CuttleError, Result};
use crate::ring::{partition_token, ranges_contain, Ring, TokenRange};
use crate::wire::{KeyspaceDef, Row, SchemaDescription, TableSchema, Value};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey {
    pub partition: Vec<Value>,
    pub clustering: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRow {
    pub columns: Vec<(String, Value)>,
    pub timestamp: u64,
}

/// A prefix tombstone: deletes every row of the partition whose clustering
/// key starts with the prefix, at or before the tombstone's timestamp.
type TombKey = (Vec<Value>, Vec<Value>);

#[derive(Debug, Default)]
struct Memtable {
    rows: BTreeMap<RowKey, VersionedRow>,
    tombstones: BTreeMap<TombKey, u64>,
}

impl Memtable {
    fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.tombstones.is_empty()
    }
}

/// On-disk sstable payload.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SsTableData {
    rows: Vec<(RowKey, VersionedRow)>,
    tombstones: Vec<(TombKey, u64)>,
}

#[derive(Debug)]
struct SsTable {
    gen: u64,
    dir_index: usize,
    path: PathBuf,
    rows: BTreeMap<RowKey, VersionedRow>,
    tombstones: BTreeMap<TombKey, u64>,
}

#[derive(Debug)]
struct TableState {
    schema: TableSchema,
    memtable: Memtable,
    sstables: Vec<SsTable>,
}

#[derive(Debug)]
struct KeyspaceState {
    replication_factor: usize,
    tables: BTreeMap<String, TableState>,
}

#[derive(Debug, Serialize, Deserialize)]
enum LogRecord {
    Write {
        keyspace: String,
        table: String,
        partition: Vec<Value>,
        clustering: Vec<Value>,
        columns: Vec<(String, Value)>,
        timestamp: u64,
    },
    DeletePrefix {
        keyspace: String,
        table: String,
        partition: Vec<Value>,
        prefix: Vec<Value>,
        timestamp: u64,
    },
}

pub struct Store {
    node_dir: PathBuf,
    datadir_count: usize,
    keyspaces: BTreeMap<String, KeyspaceState>,
    denylisted: BTreeSet<usize>,
    next_gen: u64,
    auto_compaction: bool,
}

impl Store {
    /// Open (or create) the store under a node directory: recover sstables,
    /// then replay the commitlog into memtables.
    pub fn open(node_dir: impl Into<PathBuf>, datadir_count: usize) -> Result<Self> {
        let node_dir = node_dir.into();
        for index in 0..datadir_count {
            std::fs::create_dir_all(node_dir.join(format!("data{index}")))?;
        }
        std::fs::create_dir_all(node_dir.join("commitlog"))?;
        std::fs::create_dir_all(node_dir.join("conf"))?;

        let mut store = Self {
            node_dir,
            datadir_count,
            keyspaces: BTreeMap::new(),
            denylisted: BTreeSet::new(),
            next_gen: 1,
            auto_compaction: true,
        };
        store.load_schema()?;
        store.load_sstables()?;
        store.replay_commitlog()?;
        Ok(store)
    }

    // ---- schema ----

    pub fn create_keyspace(&mut self, name: &str, replication_factor: usize) -> Result<()> {
        if self.keyspaces.contains_key(name) {
            tracing::debug!(keyspace = name, "keyspace already exists");
            return Ok(());
        }
        self.keyspaces.insert(
            name.to_string(),
            KeyspaceState {
                replication_factor,
                tables: BTreeMap::new(),
            },
        );
        tracing::info!(keyspace = name, rf = replication_factor, "keyspace created");
        self.persist_schema()
    }

    pub fn alter_keyspace(&mut self, name: &str, replication_factor: usize) -> Result<()> {
        let ks = self
            .keyspaces
            .get_mut(name)
            .ok_or_else(|| CuttleError::UnknownKeyspace(name.to_string()))?;
        ks.replication_factor = replication_factor;
        tracing::info!(
            keyspace = name,
            rf = replication_factor,
            "replication factor altered"
        );
        self.persist_schema()
    }

    pub fn create_table(&mut self, keyspace: &str, table: &str, schema: TableSchema) -> Result<()> {
        let ks = self
            .keyspaces
            .get_mut(keyspace)
            .ok_or_else(|| CuttleError::UnknownKeyspace(keyspace.to_string()))?;
        if ks.tables.contains_key(table) {
            tracing::debug!(keyspace, table, "table already exists");
            return Ok(());
        }
        ks.tables.insert(
            table.to_string(),
            TableState {
                schema,
                memtable: Memtable::default(),
                sstables: Vec::new(),
            },
        );
        tracing::info!(keyspace, table, "table created");
        self.persist_schema()
    }

    pub fn schema_description(&self) -> SchemaDescription {
        SchemaDescription {
            keyspaces: self
                .keyspaces
                .iter()
                .map(|(name, ks)| KeyspaceDef {
                    name: name.clone(),
                    replication_factor: ks.replication_factor,
                    tables: ks
                        .tables
                        .iter()
                        .map(|(t, state)| (t.clone(), state.schema.clone()))
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn apply_schema(&mut self, description: &SchemaDescription) -> Result<()> {
        for ks in &description.keyspaces {
            self.create_keyspace(&ks.name, ks.replication_factor)?;
            // Replication changes must win over a stale local definition.
            self.alter_keyspace(&ks.name, ks.replication_factor)?;
            for (table, schema) in &ks.tables {
                self.create_table(&ks.name, table, schema.clone())?;
            }
        }
        Ok(())
    }

    /// Every (keyspace, rf, table) triple currently defined.
    pub fn tables(&self) -> Vec<(String, usize, String)> {
        self.keyspaces
            .iter()
            .flat_map(|(ks, state)| {
                state
                    .tables
                    .keys()
                    .map(move |t| (ks.clone(), state.replication_factor, t.clone()))
            })
            .collect()
    }

    // ---- write path ----

    pub fn apply_write(
        &mut self,
        keyspace: &str,
        table: &str,
        partition: Vec<Value>,
        clustering: Vec<Value>,
        columns: Vec<(String, Value)>,
        timestamp: u64,
    ) -> Result<()> {
        self.table_state(keyspace, table)?;
        self.append_commitlog(&LogRecord::Write {
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            partition: partition.clone(),
            clustering: clustering.clone(),
            columns: columns.clone(),
            timestamp,
        })?;
        self.memtable_write(keyspace, table, partition, clustering, columns, timestamp)
    }

    pub fn apply_delete(
        &mut self,
        keyspace: &str,
        table: &str,
        partition: Vec<Value>,
        prefix: Vec<Value>,
        timestamp: u64,
    ) -> Result<()> {
        self.table_state(keyspace, table)?;
        self.append_commitlog(&LogRecord::DeletePrefix {
            keyspace: keyspace.to_string(),
            table: table.to_string(),
            partition: partition.clone(),
            prefix: prefix.clone(),
            timestamp,
        })?;
        self.memtable_delete(keyspace, table, partition, prefix, timestamp)
    }

    fn memtable_write(
        &mut self,
        keyspace: &str,
        table: &str,
        partition: Vec<Value>,
        clustering: Vec<Value>,
        columns: Vec<(String, Value)>,
        timestamp: u64,
    ) -> Result<()> {
        let state = self.table_state_mut(keyspace, table)?;
        let key = RowKey {
            partition,
            clustering,
        };
        match state.memtable.rows.get(&key) {
            Some(existing) if existing.timestamp > timestamp => {}
            _ => {
                state
                    .memtable
                    .rows
                    .insert(key, VersionedRow { columns, timestamp });
            }
        }
        Ok(())
    }

    fn memtable_delete(
        &mut self,
        keyspace: &str,
        table: &str,
        partition: Vec<Value>,
        prefix: Vec<Value>,
        timestamp: u64,
    ) -> Result<()> {
        let state = self.table_state_mut(keyspace, table)?;
        let entry = state
            .memtable
            .tombstones
            .entry((partition, prefix))
            .or_insert(0);
        *entry = (*entry).max(timestamp);
        Ok(())
    }

    // ---- read path ----

    /// Resolved rows of one partition, optionally narrowed to a clustering
    /// prefix, in the table's clustering order.
    pub fn read_rows(
        &self,
        keyspace: &str,
        table: &str,
        partition: &[Value],
        prefix: &[Value],
    ) -> Result<Vec<Row>> {
        let state = self.table_state(keyspace, table)?;
        let mut rows: BTreeMap<RowKey, VersionedRow> = BTreeMap::new();
        let mut tombstones: BTreeMap<TombKey, u64> = BTreeMap::new();

        for sstable in &state.sstables {
            collect_partition(&sstable.rows, partition, &mut rows);
            collect_tombstones(&sstable.tombstones, partition, &mut tombstones);
        }
        collect_partition(&state.memtable.rows, partition, &mut rows);
        collect_tombstones(&state.memtable.tombstones, partition, &mut tombstones);

        let mut out: Vec<Row> = rows
            .into_iter()
            .filter(|(key, row)| {
                key.clustering.starts_with(prefix) && !shadowed(key, row, &tombstones)
            })
            .map(|(key, row)| to_row(key, row))
            .collect();
        if state.schema.reverse_clustering {
            out.reverse();
        }
        Ok(out)
    }

    pub fn count_rows(
        &self,
        keyspace: &str,
        table: &str,
        partition: &[Value],
        prefix: &[Value],
    ) -> Result<u64> {
        Ok(self.read_rows(keyspace, table, partition, prefix)?.len() as u64)
    }

    /// Fully resolved view of a table (all partitions, tombstones applied).
    pub fn resolved_rows(&self, keyspace: &str, table: &str) -> Result<Vec<Row>> {
        let state = self.table_state(keyspace, table)?;
        let mut rows: BTreeMap<RowKey, VersionedRow> = BTreeMap::new();
        let mut tombstones: BTreeMap<TombKey, u64> = BTreeMap::new();
        for sstable in &state.sstables {
            merge_rows(&sstable.rows, &mut rows);
            merge_tombstones(&sstable.tombstones, &mut tombstones);
        }
        merge_rows(&state.memtable.rows, &mut rows);
        merge_tombstones(&state.memtable.tombstones, &mut tombstones);
        Ok(rows
            .into_iter()
            .filter(|(key, row)| !shadowed(key, row, &tombstones))
            .map(|(key, row)| to_row(key, row))
            .collect())
    }

    // ---- maintenance ----

    /// Data directories currently accepting writes.
    pub fn writable_dirs(&self) -> Result<Vec<usize>> {
        let dirs: Vec<usize> = (0..self.datadir_count)
            .filter(|index| !self.denylisted.contains(index))
            .collect();
        if dirs.is_empty() {
            return Err(CuttleError::Admin(
                "all data directories are denylisted".to_string(),
            ));
        }
        Ok(dirs)
    }

    /// Flush every memtable into per-directory sstables, then truncate the
    /// commitlog. Rows are bucketed by partition token across the writable
    /// directories.
    pub fn flush(&mut self) -> Result<usize> {
        let writable = self.writable_dirs()?;
        let names: Vec<(String, String)> = self
            .keyspaces
            .iter()
            .flat_map(|(ks, state)| state.tables.keys().map(move |t| (ks.clone(), t.clone())))
            .collect();

        let mut written = 0usize;
        for (keyspace, table) in names {
            let state = self.table_state_mut(&keyspace, &table)?;
            if state.memtable.is_empty() {
                continue;
            }
            let memtable = std::mem::take(&mut state.memtable);
            let mut buckets: BTreeMap<usize, SsTableData> = BTreeMap::new();
            for (key, row) in memtable.rows {
                let dir = bucket_dir(&writable, partition_token(&key.partition));
                buckets.entry(dir).or_default().rows.push((key, row));
            }
            for (key, ts) in memtable.tombstones {
                let dir = bucket_dir(&writable, partition_token(&key.0));
                buckets.entry(dir).or_default().tombstones.push((key, ts));
            }
            let rows_flushed: usize = buckets.values().map(|b| b.rows.len()).sum();
            let file_count = buckets.len();
            for (dir_index, data) in buckets {
                let gen = self.next_gen;
                self.next_gen += 1;
                let sstable = write_sstable(&self.node_dir, dir_index, &keyspace, &table, gen, data)?;
                self.table_state_mut(&keyspace, &table)?
                    .sstables
                    .push(sstable);
                written += 1;
            }
            tracing::info!(
                keyspace = keyspace.as_str(),
                table = table.as_str(),
                rows = rows_flushed,
                sstables = file_count,
                "memtable flushed"
            );
        }
        self.truncate_commitlog()?;
        Ok(written)
    }

    /// Major compaction: merge each table's sstables into one rewrite,
    /// dropping shadowed rows. Tombstones are carried forward.
    pub fn compact(&mut self) -> Result<()> {
        let writable = self.writable_dirs()?;
        let names: Vec<(String, String)> = self
            .keyspaces
            .iter()
            .flat_map(|(ks, state)| state.tables.keys().map(move |t| (ks.clone(), t.clone())))
            .collect();
        for (keyspace, table) in names {
            let state = self.table_state_mut(&keyspace, &table)?;
            let worth_rewriting = state.sstables.len() >= 2
                || state.sstables.iter().any(|s| !s.tombstones.is_empty());
            if !worth_rewriting {
                continue;
            }
            let old: Vec<SsTable> = std::mem::take(&mut state.sstables);
            let mut rows: BTreeMap<RowKey, VersionedRow> = BTreeMap::new();
            let mut tombstones: BTreeMap<TombKey, u64> = BTreeMap::new();
            for sstable in &old {
                merge_rows(&sstable.rows, &mut rows);
                merge_tombstones(&sstable.tombstones, &mut tombstones);
            }
            rows.retain(|key, row| !shadowed(key, row, &tombstones));
            for sstable in &old {
                std::fs::remove_file(&sstable.path)?;
            }
            let input_count = old.len();
            let replacements =
                self.write_bucketed(&writable, &keyspace, &table, rows, tombstones)?;
            tracing::info!(
                keyspace = keyspace.as_str(),
                table = table.as_str(),
                inputs = input_count,
                outputs = replacements,
                "compaction complete"
            );
        }
        Ok(())
    }

    /// Drop rows this node no longer replicates under the given topology.
    /// Flushes first so the rewrite covers everything durable.
    pub fn cleanup(&mut self, ring: &Ring, node_name: &str) -> Result<()> {
        self.flush()?;
        let rf_by_keyspace: BTreeMap<String, usize> = self
            .keyspaces
            .iter()
            .map(|(name, ks)| (name.clone(), ks.replication_factor))
            .collect();
        for (keyspace, rf) in rf_by_keyspace {
            let tables: Vec<String> = self.keyspaces[&keyspace].tables.keys().cloned().collect();
            for table in tables {
                let state = self.table_state_mut(&keyspace, &table)?;
                let mut dropped = 0usize;
                let mut rewrites: Vec<(usize, SsTableData)> = Vec::new();
                let mut keep: Vec<SsTable> = Vec::new();
                for mut sstable in std::mem::take(&mut state.sstables) {
                    let rows_before = sstable.rows.len();
                    let tombstones_before = sstable.tombstones.len();
                    let owned = |partition: &[Value]| {
                        ring.is_replica(node_name, partition_token(partition), rf)
                    };
                    sstable.rows.retain(|key, _| owned(&key.partition));
                    sstable.tombstones.retain(|key, _| owned(&key.0));
                    if sstable.rows.len() == rows_before
                        && sstable.tombstones.len() == tombstones_before
                    {
                        keep.push(sstable);
                        continue;
                    }
                    dropped += rows_before - sstable.rows.len();
                    std::fs::remove_file(&sstable.path)?;
                    if !sstable.rows.is_empty() || !sstable.tombstones.is_empty() {
                        rewrites.push((
                            sstable.dir_index,
                            SsTableData {
                                rows: sstable.rows.into_iter().collect(),
                                tombstones: sstable.tombstones.into_iter().collect(),
                            },
                        ));
                    }
                }
                state.sstables = keep;
                for (dir_index, data) in rewrites {
                    let gen = self.next_gen;
                    self.next_gen += 1;
                    let sstable =
                        write_sstable(&self.node_dir, dir_index, &keyspace, &table, gen, data)?;
                    self.table_state_mut(&keyspace, &table)?
                        .sstables
                        .push(sstable);
                }
                if dropped > 0 {
                    tracing::info!(
                        keyspace = keyspace.as_str(),
                        table = table.as_str(),
                        rows = dropped,
                        "cleanup dropped rows"
                    );
                }
            }
        }
        Ok(())
    }

    /// Rewrite sstables that sit in a denylisted directory or whose rows no
    /// longer bucket to the directory holding them. Logs the no-op case per
    /// table.
    pub fn relocate_sstables(&mut self) -> Result<()> {
        let writable = self.writable_dirs()?;
        let names: Vec<(String, String)> = self
            .keyspaces
            .iter()
            .flat_map(|(ks, state)| state.tables.keys().map(move |t| (ks.clone(), t.clone())))
            .collect();
        for (keyspace, table) in names {
            let state = self.table_state_mut(&keyspace, &table)?;
            let mut misplaced: Vec<SsTable> = Vec::new();
            let mut keep: Vec<SsTable> = Vec::new();
            for sstable in std::mem::take(&mut state.sstables) {
                if is_misplaced(&sstable, &writable) {
                    misplaced.push(sstable);
                } else {
                    keep.push(sstable);
                }
            }
            state.sstables = keep;
            if misplaced.is_empty() {
                tracing::info!("No sstables to relocate for {keyspace}.{table}");
                continue;
            }
            let mut rows: BTreeMap<RowKey, VersionedRow> = BTreeMap::new();
            let mut tombstones: BTreeMap<TombKey, u64> = BTreeMap::new();
            for sstable in &misplaced {
                merge_rows(&sstable.rows, &mut rows);
                merge_tombstones(&sstable.tombstones, &mut tombstones);
            }
            for sstable in &misplaced {
                std::fs::remove_file(&sstable.path)?;
            }
            let moved = misplaced.len();
            let outputs = self.write_bucketed(&writable, &keyspace, &table, rows, tombstones)?;
            tracing::info!(
                keyspace = keyspace.as_str(),
                table = table.as_str(),
                relocated = moved,
                outputs,
                "sstables relocated"
            );
        }
        Ok(())
    }

    pub fn mark_unwritable(&mut self, dir_index: usize) -> Result<()> {
        if dir_index >= self.datadir_count {
            return Err(CuttleError::Admin(format!(
                "no data directory with index {dir_index}"
            )));
        }
        self.denylisted.insert(dir_index);
        tracing::info!(dir_index, "data directory marked unwritable");
        Ok(())
    }

    pub fn denylisted_dirs(&self) -> Vec<usize> {
        self.denylisted.iter().copied().collect()
    }

    /// Resolve a filesystem path to a data directory index.
    pub fn dir_index_of(&self, path: &Path) -> Result<usize> {
        for index in 0..self.datadir_count {
            if self.node_dir.join(format!("data{index}")) == path {
                return Ok(index);
            }
        }
        Err(CuttleError::Admin(format!(
            "{} is not a data directory of this node",
            path.display()
        )))
    }

    pub fn set_auto_compaction(&mut self, enabled: bool) {
        self.auto_compaction = enabled;
        tracing::info!(enabled, "automatic compaction toggled");
    }

    pub fn auto_compaction_enabled(&self) -> bool {
        self.auto_compaction
    }

    // ---- streaming ----

    /// Resolved rows of a table whose partition token falls in any of the
    /// given ranges.
    pub fn stream_out(
        &self,
        keyspace: &str,
        table: &str,
        ranges: &[TokenRange],
    ) -> Result<Vec<Row>> {
        Ok(self
            .resolved_rows(keyspace, table)?
            .into_iter()
            .filter(|row| ranges_contain(ranges, partition_token(&row.partition)))
            .collect())
    }

    /// Write a streamed batch straight to sstables, bypassing the
    /// commitlog (the files themselves are the durable copy).
    pub fn stream_in(&mut self, keyspace: &str, table: &str, rows: Vec<Row>) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.table_state(keyspace, table)?;
        let writable = self.writable_dirs()?;
        let mut deduped: BTreeMap<RowKey, VersionedRow> = BTreeMap::new();
        let total = rows.len();
        for row in rows {
            let (key, versioned) = from_row(row);
            match deduped.get(&key) {
                Some(existing) if existing.timestamp > versioned.timestamp => {}
                _ => {
                    deduped.insert(key, versioned);
                }
            }
        }
        let outputs =
            self.write_bucketed(&writable, keyspace, table, deduped, BTreeMap::new())?;
        tracing::info!(keyspace, table, rows = total, outputs, "stream received");
        Ok(())
    }

    // ---- internals ----

    fn write_bucketed(
        &mut self,
        writable: &[usize],
        keyspace: &str,
        table: &str,
        rows: BTreeMap<RowKey, VersionedRow>,
        tombstones: BTreeMap<TombKey, u64>,
    ) -> Result<usize> {
        let mut buckets: BTreeMap<usize, SsTableData> = BTreeMap::new();
        for (key, row) in rows {
            let dir = bucket_dir(writable, partition_token(&key.partition));
            buckets.entry(dir).or_default().rows.push((key, row));
        }
        for (key, ts) in tombstones {
            let dir = bucket_dir(writable, partition_token(&key.0));
            buckets.entry(dir).or_default().tombstones.push((key, ts));
        }
        let outputs = buckets.len();
        for (dir_index, data) in buckets {
            let gen = self.next_gen;
            self.next_gen += 1;
            let sstable = write_sstable(&self.node_dir, dir_index, keyspace, table, gen, data)?;
            self.table_state_mut(keyspace, table)?.sstables.push(sstable);
        }
        Ok(outputs)
    }

    fn table_state(&self, keyspace: &str, table: &str) -> Result<&TableState> {
        self.keyspaces
            .get(keyspace)
            .ok_or_else(|| CuttleError::UnknownKeyspace(keyspace.to_string()))?
            .tables
            .get(table)
            .ok_or_else(|| CuttleError::Query(format!("unknown table {keyspace}.{table}")))
    }

    fn table_state_mut(&mut self, keyspace: &str, table: &str) -> Result<&mut TableState> {
        self.keyspaces
            .get_mut(keyspace)
            .ok_or_else(|| CuttleError::UnknownKeyspace(keyspace.to_string()))?
            .tables
            .get_mut(table)
            .ok_or_else(|| CuttleError::Query(format!("unknown table {keyspace}.{table}")))
    }

    fn schema_path(&self) -> PathBuf {
        self.node_dir.join("conf").join("schema.json")
    }

    fn persist_schema(&self) -> Result<()> {
        let description = self.schema_description();
        std::fs::write(
            self.schema_path(),
            serde_json::to_string_pretty(&description)?,
        )?;
        Ok(())
    }

    fn load_schema(&mut self) -> Result<()> {
        let path = self.schema_path();
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&path)?;
        let description: SchemaDescription = serde_json::from_str(&raw)?;
        for ks in description.keyspaces {
            self.keyspaces.insert(
                ks.name,
                KeyspaceState {
                    replication_factor: ks.replication_factor,
                    tables: ks
                        .tables
                        .into_iter()
                        .map(|(t, schema)| {
                            (
                                t,
                                TableState {
                                    schema,
                                    memtable: Memtable::default(),
                                    sstables: Vec::new(),
                                },
                            )
                        })
                        .collect(),
                },
            );
        }
        Ok(())
    }

    fn load_sstables(&mut self) -> Result<()> {
        let mut max_gen = 0u64;
        let names: Vec<(String, String)> = self
            .keyspaces
            .iter()
            .flat_map(|(ks, state)| state.tables.keys().map(move |t| (ks.clone(), t.clone())))
            .collect();
        for (keyspace, table) in names {
            for dir_index in 0..self.datadir_count {
                let dir = self
                    .node_dir
                    .join(format!("data{dir_index}"))
                    .join(&keyspace)
                    .join(&table);
                if !dir.is_dir() {
                    continue;
                }
                for entry in std::fs::read_dir(&dir)? {
                    let path = entry?.path();
                    let Some(gen) = parse_generation(&path) else {
                        tracing::warn!(path = %path.display(), "ignoring unrecognized artifact");
                        continue;
                    };
                    let raw = std::fs::read(&path)?;
                    let data: SsTableData = bincode::deserialize(&raw)?;
                    max_gen = max_gen.max(gen);
                    self.table_state_mut(&keyspace, &table)?.sstables.push(SsTable {
                        gen,
                        dir_index,
                        path,
                        rows: data.rows.into_iter().collect(),
                        tombstones: data.tombstones.into_iter().collect(),
                    });
                }
            }
        }
        self.next_gen = max_gen + 1;
        Ok(())
    }

    fn commitlog_path(&self) -> PathBuf {
        self.node_dir.join("commitlog").join("commitlog.bin")
    }

    fn append_commitlog(&mut self, record: &LogRecord) -> Result<()> {
        let body = bincode::serialize(record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.commitlog_path())?;
        file.write_all(&(body.len() as u32).to_le_bytes())?;
        file.write_all(&body)?;
        Ok(())
    }

    fn truncate_commitlog(&mut self) -> Result<()> {
        let path = self.commitlog_path();
        if path.exists() {
            std::fs::write(&path, b"")?;
        }
        Ok(())
    }

    fn replay_commitlog(&mut self) -> Result<()> {
        let path = self.commitlog_path();
        if !path.exists() {
            return Ok(());
        }
        let mut file = std::fs::File::open(&path)?;
        let mut replayed = 0usize;
        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut body = vec![0u8; len];
            match file.read_exact(&mut body) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    // Torn tail from an unclean shutdown; everything before
                    // it already replayed.
                    tracing::warn!("commitlog ends in a torn record, ignoring the tail");
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            match bincode::deserialize::<LogRecord>(&body) {
                Ok(LogRecord::Write {
                    keyspace,
                    table,
                    partition,
                    clustering,
                    columns,
                    timestamp,
                }) => {
                    self.memtable_write(&keyspace, &table, partition, clustering, columns, timestamp)?;
                    replayed += 1;
                }
                Ok(LogRecord::DeletePrefix {
                    keyspace,
                    table,
                    partition,
                    prefix,
                    timestamp,
                }) => {
                    self.memtable_delete(&keyspace, &table, partition, prefix, timestamp)?;
                    replayed += 1;
                }
                Err(e) => {
                    tracing::warn!("skipping undecodable commitlog record: {e}");
                }
            }
        }
        if replayed > 0 {
            tracing::info!(records = replayed, "commitlog replayed");
        }
        Ok(())
    }
}

fn bucket_dir(writable: &[usize], token: u64) -> usize {
    writable[(token % writable.len() as u64) as usize]
}

fn is_misplaced(sstable: &SsTable, writable: &[usize]) -> bool {
    if !writable.contains(&sstable.dir_index) {
        return true;
    }
    sstable
        .rows
        .keys()
        .map(|key| &key.partition)
        .chain(sstable.tombstones.keys().map(|key| &key.0))
        .any(|partition| bucket_dir(writable, partition_token(partition)) != sstable.dir_index)
}

fn parse_generation(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let gen = name.strip_suffix("-Data.db")?;
    gen.parse().ok()
}

fn write_sstable(
    node_dir: &Path,
    dir_index: usize,
    keyspace: &str,
    table: &str,
    gen: u64,
    mut data: SsTableData,
) -> Result<SsTable> {
    data.rows.sort_by(|a, b| a.0.cmp(&b.0));
    data.tombstones.sort_by(|a, b| a.0.cmp(&b.0));
    let dir = node_dir
        .join(format!("data{dir_index}"))
        .join(keyspace)
        .join(table);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{gen:06}-Data.db"));
    let body = bincode::serialize(&data)?;
    std::fs::write(&path, &body)?;
    Ok(SsTable {
        gen,
        dir_index,
        path,
        rows: data.rows.into_iter().collect(),
        tombstones: data.tombstones.into_iter().collect(),
    })
}

fn collect_partition(
    source: &BTreeMap<RowKey, VersionedRow>,
    partition: &[Value],
    into: &mut BTreeMap<RowKey, VersionedRow>,
) {
    let start = RowKey {
        partition: partition.to_vec(),
        clustering: Vec::new(),
    };
    for (key, row) in source.range(start..) {
        if key.partition.as_slice() != partition {
            break;
        }
        match into.get(key) {
            Some(existing) if existing.timestamp >= row.timestamp => {}
            _ => {
                into.insert(key.clone(), row.clone());
            }
        }
    }
}

fn collect_tombstones(
    source: &BTreeMap<TombKey, u64>,
    partition: &[Value],
    into: &mut BTreeMap<TombKey, u64>,
) {
    for (key, ts) in source {
        if key.0.as_slice() == partition {
            let entry = into.entry(key.clone()).or_insert(0);
            *entry = (*entry).max(*ts);
        }
    }
}

fn merge_rows(source: &BTreeMap<RowKey, VersionedRow>, into: &mut BTreeMap<RowKey, VersionedRow>) {
    for (key, row) in source {
        match into.get(key) {
            Some(existing) if existing.timestamp >= row.timestamp => {}
            _ => {
                into.insert(key.clone(), row.clone());
            }
        }
    }
}

fn merge_tombstones(source: &BTreeMap<TombKey, u64>, into: &mut BTreeMap<TombKey, u64>) {
    for (key, ts) in source {
        let entry = into.entry(key.clone()).or_insert(0);
        *entry = (*entry).max(*ts);
    }
}

fn shadowed(key: &RowKey, row: &VersionedRow, tombstones: &BTreeMap<TombKey, u64>) -> bool {
    tombstones.iter().any(|((partition, prefix), ts)| {
        *partition == key.partition && key.clustering.starts_with(prefix) && *ts >= row.timestamp
    })
}

fn to_row(key: RowKey, row: VersionedRow) -> Row {
    Row {
        partition: key.partition,
        clustering: key.clustering,
        columns: row.columns,
        timestamp: row.timestamp,
    }
}

fn from_row(row: Row) -> (RowKey, VersionedRow) {
    (
        RowKey {
            partition: row.partition,
            clustering: row.clustering,
        },
        VersionedRow {
            columns: row.columns,
            timestamp: row.timestamp,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::check::temp_dir;
    use crate::ring::{allocate_tokens, RingMember};

    fn text(s: &str) -> Value {
        Value::text(s)
    }

    fn stress_schema() -> TableSchema {
        TableSchema {
            partition_columns: vec!["key".to_string()],
            clustering_columns: vec![],
            reverse_clustering: false,
            value_columns: vec!["C0".to_string()],
        }
    }

    fn history_schema() -> TableSchema {
        TableSchema {
            partition_columns: vec!["symbol".to_string(), "year".to_string()],
            clustering_columns: vec!["month".to_string(), "day".to_string()],
            reverse_clustering: true,
            value_columns: vec!["volume".to_string()],
        }
    }

    fn open_store(dir: &Path) -> Store {
        Store::open(dir, 3).unwrap()
    }

    fn seed_stress(store: &mut Store, n: u64) {
        store.create_keyspace("keyspace1", 2).unwrap();
        store
            .create_table("keyspace1", "standard1", stress_schema())
            .unwrap();
        for i in 0..n {
            store
                .apply_write(
                    "keyspace1",
                    "standard1",
                    vec![text(&format!("key{i:010}"))],
                    vec![],
                    vec![("C0".to_string(), Value::blob(vec![0u8; 34]))],
                    i + 1,
                )
                .unwrap();
        }
    }

    #[test]
    fn test_write_flush_read_round_trip() {
        let scratch = temp_dir(Some("cuttle_store"), false);
        let mut store = open_store(scratch.path());
        seed_stress(&mut store, 100);

        // Visible before and after flushing.
        let before = store
            .read_rows("keyspace1", "standard1", &[text("key0000000007")], &[])
            .unwrap();
        assert_eq!(before.len(), 1);
        store.flush().unwrap();
        let after = store
            .read_rows("keyspace1", "standard1", &[text("key0000000007")], &[])
            .unwrap();
        assert_eq!(after, before);
    }

    #[test]
    fn test_flush_distributes_across_directories() {
        let scratch = temp_dir(Some("cuttle_store"), false);
        let mut store = open_store(scratch.path());
        seed_stress(&mut store, 600);
        store.flush().unwrap();

        let sums =
            crate::observe::datadir_sizes(scratch.path(), 3, "keyspace1", "standard1").unwrap();
        assert_eq!(sums.len(), 3);
        assert!(sums.iter().all(|&s| s > 0), "every directory got a share");
        crate::check::assert_almost_equal(&sums, 0.2, "store flush");
    }

    #[test]
    fn test_commitlog_recovery_without_flush() {
        let scratch = temp_dir(Some("cuttle_store"), false);
        {
            let mut store = open_store(scratch.path());
            seed_stress(&mut store, 10);
            // No flush: rows only live in the commitlog and memtable.
        }
        let store = open_store(scratch.path());
        let rows = store
            .read_rows("keyspace1", "standard1", &[text("key0000000003")], &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_tombstone_shadows_across_flush_and_reopen() {
        let scratch = temp_dir(Some("cuttle_store"), false);
        {
            let mut store = open_store(scratch.path());
            store.create_keyspace("financial", 1).unwrap();
            store
                .create_table("financial", "symbol_history", history_schema())
                .unwrap();
            let partition = vec![text("CORP"), Value::int(2004)];
            for month in 0..50 {
                store
                    .apply_write(
                        "financial",
                        "symbol_history",
                        partition.clone(),
                        vec![Value::int(month), Value::int(1)],
                        vec![("volume".to_string(), Value::int(100))],
                        (month + 1) as u64,
                    )
                    .unwrap();
            }
            store.flush().unwrap();
            store
                .apply_delete(
                    "financial",
                    "symbol_history",
                    partition.clone(),
                    vec![Value::int(25)],
                    1000,
                )
                .unwrap();
            store.flush().unwrap();
            assert_eq!(
                store
                    .count_rows("financial", "symbol_history", &partition, &[])
                    .unwrap(),
                49
            );
        }
        // Recovery preserves the deletion.
        let store = open_store(scratch.path());
        assert_eq!(
            store
                .count_rows(
                    "financial",
                    "symbol_history",
                    &[text("CORP"), Value::int(2004)],
                    &[]
                )
                .unwrap(),
            49
        );
        // Reverse clustering order: month 49 first.
        let rows = store
            .read_rows(
                "financial",
                "symbol_history",
                &[text("CORP"), Value::int(2004)],
                &[],
            )
            .unwrap();
        assert_eq!(rows[0].clustering[0], Value::int(49));
    }

    #[test]
    fn test_compact_merges_and_drops_shadowed() {
        let scratch = temp_dir(Some("cuttle_store"), false);
        let mut store = open_store(scratch.path());
        seed_stress(&mut store, 200);
        store.flush().unwrap();
        // Overwrite half the keys with newer timestamps, flush again.
        for i in 0..100u64 {
            store
                .apply_write(
                    "keyspace1",
                    "standard1",
                    vec![text(&format!("key{i:010}"))],
                    vec![],
                    vec![("C0".to_string(), Value::blob(vec![1u8; 34]))],
                    10_000 + i,
                )
                .unwrap();
        }
        store.flush().unwrap();
        let files_before = crate::observe::sstables_per_data_directory(
            scratch.path(),
            3,
            "keyspace1",
            "standard1",
        )
        .unwrap()
        .concat()
        .len();
        store.compact().unwrap();
        let files_after = crate::observe::sstables_per_data_directory(
            scratch.path(),
            3,
            "keyspace1",
            "standard1",
        )
        .unwrap()
        .concat()
        .len();
        assert!(files_after <= 3);
        assert!(files_after < files_before);
        // Newest value survives.
        let rows = store
            .read_rows("keyspace1", "standard1", &[text("key0000000001")], &[])
            .unwrap();
        assert_eq!(rows[0].columns[0].1, Value::blob(vec![1u8; 34]));
    }

    #[test]
    fn test_cleanup_drops_unowned_rows() {
        let scratch = temp_dir(Some("cuttle_store"), false);
        let mut store = open_store(scratch.path());
        seed_stress(&mut store, 300);
        // With two members, rf=2 would keep every row on every node.
        store.alter_keyspace("keyspace1", 1).unwrap();
        store.flush().unwrap();

        let ring = Ring::new(
            (0..2)
                .map(|i| RingMember {
                    name: format!("node{}", i + 1),
                    native_addr: "127.0.0.1:1".parse().unwrap(),
                    mgmt_addr: "127.0.0.1:2".parse().unwrap(),
                    tokens: allocate_tokens(i, 2, 1),
                })
                .collect(),
        );
        store.cleanup(&ring, "node1").unwrap();

        let remaining = store.resolved_rows("keyspace1", "standard1").unwrap();
        assert!(!remaining.is_empty());
        assert!(remaining.len() < 300);
        for row in &remaining {
            assert!(ring.is_replica("node1", partition_token(&row.partition), 1));
        }
    }

    #[test]
    fn test_relocate_moves_out_of_denylisted_dir() {
        let scratch = temp_dir(Some("cuttle_store"), false);
        let mut store = open_store(scratch.path());
        seed_stress(&mut store, 300);
        store.flush().unwrap();

        store.mark_unwritable(0).unwrap();
        store.relocate_sstables().unwrap();

        let per_dir = crate::observe::sstables_per_data_directory(
            scratch.path(),
            3,
            "keyspace1",
            "standard1",
        )
        .unwrap();
        assert!(per_dir[0].is_empty(), "denylisted directory emptied");
        assert!(!per_dir[1].is_empty());
        assert!(!per_dir[2].is_empty());
        // Nothing lost.
        assert_eq!(
            store.resolved_rows("keyspace1", "standard1").unwrap().len(),
            300
        );
    }

    #[test]
    fn test_stream_out_respects_ranges() {
        let scratch = temp_dir(Some("cuttle_store"), false);
        let mut store = open_store(scratch.path());
        seed_stress(&mut store, 100);

        let all = store
            .stream_out("keyspace1", "standard1", &[TokenRange::new(0, 0)])
            .unwrap();
        assert_eq!(all.len(), 100);

        let half = store
            .stream_out(
                "keyspace1",
                "standard1",
                &[TokenRange::new(0, u64::MAX / 2)],
            )
            .unwrap();
        assert!(half.len() < 100);
        let rest = store
            .stream_out(
                "keyspace1",
                "standard1",
                &[TokenRange::new(u64::MAX / 2, 0)],
            )
            .unwrap();
        assert_eq!(half.len() + rest.len(), 100);
    }

    #[test]
    fn test_stream_in_is_durable_without_commitlog() {
        let scratch = temp_dir(Some("cuttle_store"), false);
        {
            let mut store = open_store(scratch.path());
            store.create_keyspace("keyspace1", 2).unwrap();
            store
                .create_table("keyspace1", "standard1", stress_schema())
                .unwrap();
            let rows: Vec<Row> = (0..50)
                .map(|i| Row {
                    partition: vec![text(&format!("key{i:010}"))],
                    clustering: vec![],
                    columns: vec![("C0".to_string(), Value::blob(vec![0u8; 34]))],
                    timestamp: i + 1,
                })
                .collect();
            store.stream_in("keyspace1", "standard1", rows).unwrap();
        }
        let store = open_store(scratch.path());
        assert_eq!(
            store.resolved_rows("keyspace1", "standard1").unwrap().len(),
            50
        );
    }
}
