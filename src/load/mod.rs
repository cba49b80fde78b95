//! ARCHIVIST - Bulk Loader
//! Turns a stream of CREATE/INSERT statements into sorted, range-partitioned
//! DataFiles plus a manifest, without going through the per-row write path.
//!
//! ## Algorithm
//! 1. Every produced revision carries one load timestamp
//! 2. Revisions are buffered per partition (descriptors, then one per
//!    table); once the buffer exceeds its byte budget each partition is
//!    sorted and spilled as a run file into the job's temporary directory
//! 3. Runs of each partition are k-way merged in parallel into the final
//!    DataFiles, rolling over at the target file size
//! 4. A full-backup-shaped manifest (start 0) is published in the
//!    destination, so the output restores like any full backup
//!
//! Malformed statements, schema mismatches and duplicate primary keys fail
//! the job with an input error naming the statement. A failed job removes
//! its temporary directory and every output file it wrote.

pub mod encoding;
pub mod statement;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::BufRead;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::backup::DATA_DIR;
use crate::config::Config;
use crate::engine::datafile::{DataFileReader, DataFileWriter};
use crate::engine::merge::{DuplicatePolicy, MergeIter, RevisionIter};
use crate::engine::metrics::{Metrics, MetricsSnapshot};
use crate::error::{ArchivistError, Result};
use crate::hlc::Clock;
use crate::manifest::{self, BackupManifest, ManifestEntry};
use crate::pool::{first_error, run_parallel, CancelToken};
use crate::types::{pretty_key, KeyRevision, KeySpan, Timestamp};

use self::encoding::{
    descriptor_key, descriptor_span, encode_descriptor, encode_row, row_key, table_span, Datum,
    Descriptor, TableSchema,
};
use self::statement::{ColumnDef, Literal, Statement, StatementReader};

/// Partition holding schema descriptors. Table ids start above it.
const DESCRIPTOR_PARTITION: u32 = 0;
const FIRST_DESCRIPTOR_ID: u32 = 50;

/// Parameters of one bulk load.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Database unqualified table names resolve to. Created implicitly.
    pub database: String,
    pub dest: PathBuf,
    /// Defaults to a fresh oracle timestamp.
    pub timestamp: Option<Timestamp>,
    /// Parent of the job's temporary working directory.
    pub temp_dir: PathBuf,
    /// Sort buffer budget; defaults to `Config::memtable_max_size`.
    pub chunk_bytes: Option<usize>,
    pub cancel: CancelToken,
}

impl LoadOptions {
    pub fn new(database: impl Into<String>, dest: impl Into<PathBuf>, temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            database: database.into(),
            dest: dest.into(),
            timestamp: None,
            temp_dir: temp_dir.into(),
            chunk_bytes: None,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_timestamp(mut self, ts: Timestamp) -> Self {
        self.timestamp = Some(ts);
        self
    }

    pub fn with_chunk_bytes(mut self, bytes: usize) -> Self {
        self.chunk_bytes = Some(bytes);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone)]
pub struct LoadOutcome {
    pub manifest_path: PathBuf,
    pub manifest: BackupManifest,
    pub total_size: u64,
    /// The timestamp every loaded revision carries.
    pub timestamp: Timestamp,
    pub rows: u64,
    pub metrics: MetricsSnapshot,
}

/// Databases and tables defined so far in the statement stream.
struct Catalog {
    next_id: u32,
    default_database: String,
    databases: HashMap<String, u32>,
    tables: HashMap<(String, String), TableSchema>,
}

impl Catalog {
    fn new(default_database: &str) -> Self {
        Self {
            next_id: FIRST_DESCRIPTOR_ID,
            default_database: default_database.to_string(),
            databases: HashMap::new(),
            tables: HashMap::new(),
        }
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_database(&mut self, name: &str, if_not_exists: bool) -> std::result::Result<Option<Descriptor>, String> {
        if self.databases.contains_key(name) {
            return if if_not_exists || name == self.default_database {
                Ok(None)
            } else {
                Err(format!("database {:?} already exists", name))
            };
        }
        let id = self.allocate_id();
        self.databases.insert(name.to_string(), id);
        Ok(Some(Descriptor::Database {
            id,
            name: name.to_string(),
        }))
    }

    fn resolve_database(&self, database: Option<&str>) -> std::result::Result<(String, u32), String> {
        let name = database.unwrap_or(self.default_database.as_str());
        self.databases
            .get(name)
            .map(|id| (name.to_string(), *id))
            .ok_or_else(|| format!("database {:?} does not exist", name))
    }

    fn create_table(
        &mut self,
        database: Option<&str>,
        name: &str,
        if_not_exists: bool,
        mut columns: Vec<ColumnDef>,
        primary_key: &[String],
    ) -> std::result::Result<Option<Descriptor>, String> {
        let (db_name, database_id) = self.resolve_database(database)?;
        let qualified = (db_name, name.to_string());
        if self.tables.contains_key(&qualified) {
            return if if_not_exists {
                Ok(None)
            } else {
                Err(format!("table {}.{} already exists", qualified.0, name))
            };
        }
        if columns.is_empty() {
            return Err(format!("table {} has no columns", name));
        }
        if primary_key.is_empty() {
            return Err(format!("table {} has no primary key", name));
        }
        for (i, col) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == col.name) {
                return Err(format!("duplicate column {:?}", col.name));
            }
        }
        let mut key_columns = Vec::with_capacity(primary_key.len());
        for key in primary_key {
            let idx = columns
                .iter()
                .position(|c| &c.name == key)
                .ok_or_else(|| format!("primary key column {:?} is not defined", key))?;
            if key_columns.contains(&idx) {
                return Err(format!("column {:?} repeated in primary key", key));
            }
            columns[idx].nullable = false;
            key_columns.push(idx);
        }

        let schema = TableSchema {
            id: self.allocate_id(),
            database_id,
            name: name.to_string(),
            columns,
            primary_key: key_columns,
        };
        self.tables.insert(qualified, schema.clone());
        Ok(Some(Descriptor::Table(schema)))
    }

    fn table(&self, database: Option<&str>, name: &str) -> std::result::Result<&TableSchema, String> {
        let (db_name, _) = self.resolve_database(database)?;
        self.tables
            .get(&(db_name.clone(), name.to_string()))
            .ok_or_else(|| format!("table {}.{} does not exist", db_name, name))
    }
}

/// Build a full row (schema column order) from one VALUES tuple.
fn build_row(schema: &TableSchema, columns: Option<&[String]>, values: &[Literal]) -> std::result::Result<Vec<Datum>, String> {
    let targets: Vec<usize> = match columns {
        Some(names) => {
            let mut targets = Vec::with_capacity(names.len());
            for name in names {
                let idx = schema
                    .columns
                    .iter()
                    .position(|c| &c.name == name)
                    .ok_or_else(|| format!("unknown column {:?} in table {}", name, schema.name))?;
                if targets.contains(&idx) {
                    return Err(format!("column {:?} specified more than once", name));
                }
                targets.push(idx);
            }
            targets
        }
        None => (0..schema.columns.len()).collect(),
    };
    if values.len() != targets.len() {
        return Err(format!(
            "expected {} values for table {}, got {}",
            targets.len(),
            schema.name,
            values.len()
        ));
    }

    let mut row = vec![Datum::Null; schema.columns.len()];
    for (&idx, literal) in targets.iter().zip(values) {
        row[idx] = Datum::coerce(literal, schema.columns[idx].ty)
            .map_err(|m| format!("column {:?}: {}", schema.columns[idx].name, m))?;
    }
    for (col, datum) in schema.columns.iter().zip(&row) {
        if !col.nullable && datum.is_null() {
            return Err(format!("null value in column {:?} violates not-null constraint", col.name));
        }
    }
    Ok(row)
}

struct Pending {
    rev: KeyRevision,
    statement: usize,
}

/// Byte-bounded buffer of unsorted revisions that spills sorted runs.
struct SortBuffer {
    dir: PathBuf,
    limit: usize,
    bytes: usize,
    partitions: BTreeMap<u32, Vec<Pending>>,
    runs: BTreeMap<u32, Vec<PathBuf>>,
    run_seq: usize,
}

impl SortBuffer {
    fn new(dir: PathBuf, limit: usize) -> Self {
        Self {
            dir,
            limit,
            bytes: 0,
            partitions: BTreeMap::new(),
            runs: BTreeMap::new(),
            run_seq: 0,
        }
    }

    fn add(&mut self, partition: u32, rev: KeyRevision, statement: usize) -> Result<()> {
        self.bytes += rev.size();
        self.partitions
            .entry(partition)
            .or_default()
            .push(Pending { rev, statement });
        if self.bytes >= self.limit {
            self.spill()?;
        }
        Ok(())
    }

    /// Sort every partition and write it out as a run.
    fn spill(&mut self) -> Result<()> {
        let partitions = mem::take(&mut self.partitions);
        for (partition, mut pending) in partitions {
            pending.sort_by(|a, b| a.rev.key.cmp(&b.rev.key));
            for pair in pending.windows(2) {
                if pair[0].rev.key == pair[1].rev.key {
                    return Err(ArchivistError::Input {
                        statement: Some(pair[1].statement),
                        message: format!("duplicate primary key {}", pretty_key(&pair[1].rev.key)),
                    });
                }
            }

            let path = self
                .dir
                .join(format!("run-{:08}-{:06}.sst", partition, self.run_seq));
            self.run_seq += 1;
            let mut writer = DataFileWriter::create(&path, false)?;
            for p in &pending {
                writer.add(&p.rev)?;
            }
            writer.finish()?;
            log::debug!(
                "spilled run {:?} ({} revisions, partition {})",
                path,
                pending.len(),
                partition
            );
            self.runs.entry(partition).or_default().push(path);
        }
        self.bytes = 0;
        Ok(())
    }
}

struct MergeTask {
    partition: u32,
    span: KeySpan,
    runs: Vec<PathBuf>,
}

/// Shared state of the merge phase.
struct MergeContext<'a> {
    data_dir: &'a Path,
    target_file_size: u64,
    sync: bool,
    metrics: &'a Metrics,
    cancel: &'a CancelToken,
    written: &'a Mutex<Vec<PathBuf>>,
}

impl MergeContext<'_> {
    fn create(&self, partition: u32, seq: usize) -> Result<(DataFileWriter, String)> {
        let name = format!("{:08}-{:04}.sst", partition, seq);
        let path = self.data_dir.join(&name);
        self.written
            .lock()
            .map_err(|_| ArchivistError::Poisoned("load"))?
            .push(path.clone());
        Ok((DataFileWriter::create(path, self.sync)?, name))
    }

    fn finish(&self, writer: DataFileWriter, name: &str, start: Vec<u8>, end: Vec<u8>) -> Result<ManifestEntry> {
        let meta = writer.finish()?;
        self.metrics.record_file_written(meta.size);
        Ok(ManifestEntry {
            start_key: start,
            end_key: end,
            file_ref: Some(format!("{}/{}", DATA_DIR, name)),
            byte_size: meta.size,
            entry_count: meta.footer.entry_count,
            checksum: meta.checksum,
        })
    }

    /// Merge one partition's runs into final files covering its span.
    fn merge(&self, task: &MergeTask) -> Result<Vec<ManifestEntry>> {
        let mut sources: Vec<RevisionIter> = Vec::with_capacity(task.runs.len());
        for run in &task.runs {
            sources.push(Box::new(DataFileReader::open(run)?));
        }
        let merged = MergeIter::new(sources, DuplicatePolicy::Reject);

        let mut entries = Vec::new();
        let mut current: Option<(DataFileWriter, String, Vec<u8>)> = None;
        for rev in merged {
            self.cancel.check()?;
            let rev = rev?;
            let rollover = current
                .as_ref()
                .map_or(false, |(w, _, _)| w.bytes_written() >= self.target_file_size);
            if rollover {
                if let Some((writer, name, start)) = current.take() {
                    entries.push(self.finish(writer, &name, start, rev.key.clone())?);
                }
            }
            if current.is_none() {
                let start = if entries.is_empty() {
                    task.span.start.clone()
                } else {
                    rev.key.clone()
                };
                let (writer, name) = self.create(task.partition, entries.len())?;
                current = Some((writer, name, start));
            }
            if let Some((writer, _, _)) = current.as_mut() {
                writer.add(&rev)?;
            }
        }
        if let Some((writer, name, start)) = current.take() {
            entries.push(self.finish(writer, &name, start, task.span.end.clone())?);
        }
        Ok(entries)
    }
}

/// Run a bulk load of the statements read from `reader`.
pub fn load<R: BufRead>(reader: R, clock: &Clock, config: &Config, options: &LoadOptions) -> Result<LoadOutcome> {
    config.validate()?;
    if manifest::exists(&options.dest) {
        return Err(ArchivistError::Consistency(format!(
            "{:?} already holds a backup manifest",
            options.dest
        )));
    }
    let ts = match options.timestamp {
        Some(ts) => {
            clock.update(ts)?;
            ts
        }
        None => clock.now()?,
    };

    let data_dir = options.dest.join(DATA_DIR);
    let written = Mutex::new(Vec::new());
    let metrics = Metrics::new();

    let result = run_job(reader, ts, config, options, &data_dir, &written, &metrics);
    match result {
        Ok((manifest_path, manifest, rows)) => {
            log::info!(
                "loaded {} rows into {:?} at {} ({} files, {} bytes)",
                rows,
                options.dest,
                ts,
                manifest.files().count(),
                manifest.total_size
            );
            Ok(LoadOutcome {
                manifest_path,
                total_size: manifest.total_size,
                manifest,
                timestamp: ts,
                rows,
                metrics: metrics.snapshot(),
            })
        }
        Err(err) => {
            log::warn!("load into {:?} failed: {}", options.dest, err);
            for path in written.into_inner().unwrap_or_default() {
                let _ = fs::remove_file(path);
            }
            let _ = fs::remove_dir(&data_dir);
            Err(err)
        }
    }
}

fn run_job<R: BufRead>(
    reader: R,
    ts: Timestamp,
    config: &Config,
    options: &LoadOptions,
    data_dir: &Path,
    written: &Mutex<Vec<PathBuf>>,
    metrics: &Metrics,
) -> Result<(PathBuf, BackupManifest, u64)> {
    fs::create_dir_all(&options.temp_dir)?;
    let temp = tempfile::Builder::new()
        .prefix("archivist-load-")
        .tempdir_in(&options.temp_dir)?;
    log::debug!("load at {} working in {:?}", ts, temp.path());
    let limit = options.chunk_bytes.unwrap_or(config.memtable_max_size).max(1);
    let mut buffer = SortBuffer::new(temp.path().to_path_buf(), limit);
    let mut catalog = Catalog::new(&options.database);
    let mut rows = 0u64;

    let input = |statement: usize| move |message: String| ArchivistError::Input {
        statement: Some(statement),
        message,
    };

    let descriptor = |desc: &Descriptor| -> Result<KeyRevision> {
        Ok(KeyRevision::put(descriptor_key(desc.id()), ts, encode_descriptor(desc)?))
    };

    if let Ok(Some(desc)) = catalog.create_database(&options.database, true) {
        buffer.add(DESCRIPTOR_PARTITION, descriptor(&desc)?, 0)?;
    }

    for item in StatementReader::new(reader) {
        options.cancel.check()?;
        let (index, sql) = item?;
        match statement::parse(index, &sql)? {
            Statement::CreateDatabase {
                name,
                if_not_exists,
            } => {
                if let Some(desc) = catalog.create_database(&name, if_not_exists).map_err(input(index))? {
                    buffer.add(DESCRIPTOR_PARTITION, descriptor(&desc)?, index)?;
                }
            }
            Statement::CreateTable {
                database,
                name,
                if_not_exists,
                columns,
                primary_key,
            } => {
                let created = catalog
                    .create_table(database.as_deref(), &name, if_not_exists, columns, &primary_key)
                    .map_err(input(index))?;
                if let Some(desc) = created {
                    buffer.add(DESCRIPTOR_PARTITION, descriptor(&desc)?, index)?;
                }
            }
            Statement::Insert {
                database,
                table,
                columns,
                rows: values,
            } => {
                let schema = catalog.table(database.as_deref(), &table).map_err(input(index))?;
                for tuple in &values {
                    let row = build_row(schema, columns.as_deref(), tuple).map_err(input(index))?;
                    let rev = KeyRevision::put(row_key(schema, &row), ts, encode_row(&row)?);
                    buffer.add(schema.id, rev, index)?;
                    rows += 1;
                }
            }
        }
    }
    buffer.spill()?;

    let tasks: Vec<MergeTask> = mem::take(&mut buffer.runs)
        .into_iter()
        .map(|(partition, runs)| MergeTask {
            partition,
            span: if partition == DESCRIPTOR_PARTITION {
                descriptor_span()
            } else {
                table_span(partition)
            },
            runs,
        })
        .collect();

    fs::create_dir_all(data_dir)?;
    let ctx = MergeContext {
        data_dir,
        target_file_size: config.target_file_size,
        sync: config.sync_writes,
        metrics,
        cancel: &options.cancel,
        written,
    };
    let results = run_parallel(&tasks, config.worker_threads, &options.cancel, |task| ctx.merge(task));
    let entries = first_error(results)?;
    options.cancel.check()?;

    let mut manifest = BackupManifest::new(
        options.database.clone(),
        Timestamp::ZERO,
        ts.next(),
        vec![KeySpan::full()],
    );
    for entry in entries.into_iter().flatten() {
        manifest.add_entry(entry);
    }
    manifest.seal();
    let path = manifest.write(&options.dest)?;
    temp.close()?;
    Ok((path, manifest, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::datafile::DataFileReader;
    use std::time::Duration;

    fn bank(rows: usize) -> String {
        let mut sql = String::from(
            "CREATE TABLE bench.bank (id INT PRIMARY KEY, balance INT, payload STRING, FAMILY (id, balance, payload));\n",
        );
        for chunk in (0..rows).collect::<Vec<_>>().chunks(100) {
            let values: Vec<String> = chunk
                .iter()
                .map(|i| format!("({}, {}, 'initial-{}')", i, i * 10, i))
                .collect();
            sql.push_str(&format!("INSERT INTO bench.bank VALUES {};\n", values.join(", ")));
        }
        sql
    }

    fn config() -> Config {
        Config::default()
            .with_sync_writes(false)
            .with_worker_threads(2)
    }

    fn working_dirs(parent: &Path) -> usize {
        fs::read_dir(parent)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("archivist-load-"))
            .count()
    }

    #[test]
    fn test_load_writes_sorted_files_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Clock::new(Duration::from_millis(500));
        let options = LoadOptions::new("bench", dir.path().join("out"), dir.path())
            .with_chunk_bytes(4 * 1024);
        let outcome = load(bank(1000).as_bytes(), &clock, &config(), &options).unwrap();

        assert_eq!(outcome.rows, 1000);
        assert!(outcome.total_size > 0);
        assert!(outcome.manifest.is_full());
        assert_eq!(outcome.manifest.end_timestamp, outcome.timestamp.next());
        manifest::validate_chain(&[outcome.manifest.header()]).unwrap();

        let mut revisions = 0;
        for entry in outcome.manifest.files() {
            let path = dir.path().join("out").join(entry.file_ref.as_ref().unwrap());
            let span = entry.span();
            for rev in DataFileReader::open(path).unwrap() {
                let rev = rev.unwrap();
                assert!(span.contains(&rev.key));
                assert_eq!(rev.timestamp, outcome.timestamp);
                revisions += 1;
            }
        }
        // Rows plus the database and table descriptors.
        assert_eq!(revisions, 1002);

        assert_eq!(working_dirs(dir.path()), 0);
    }

    #[test]
    fn test_files_roll_over_at_target_size() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Clock::default();
        let config = config().with_target_file_size(2 * 1024);
        let options = LoadOptions::new("bench", dir.path().join("out"), dir.path());
        let outcome = load(bank(500).as_bytes(), &clock, &config, &options).unwrap();
        assert!(outcome.manifest.files().count() > 2);
        manifest::validate_chain(&[outcome.manifest.header()]).unwrap();
    }

    #[test]
    fn test_duplicate_primary_key_names_statement() {
        let dir = tempfile::tempdir().unwrap();
        let sql = "CREATE TABLE t (id INT PRIMARY KEY, v STRING);\n\
                   INSERT INTO t VALUES (1, 'a');\n\
                   INSERT INTO t VALUES (2, 'b'), (1, 'c');";
        let options = LoadOptions::new("bench", dir.path().join("out"), dir.path());
        let err = load(sql.as_bytes(), &Clock::default(), &config(), &options).unwrap_err();
        assert!(matches!(err, ArchivistError::Input { statement: Some(3), .. }));
        assert!(!manifest::exists(&dir.path().join("out")));
        assert_eq!(working_dirs(dir.path()), 0);
    }

    #[test]
    fn test_duplicates_across_runs_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let sql = "CREATE TABLE t (id INT PRIMARY KEY);\n\
                   INSERT INTO t VALUES (1);\n\
                   INSERT INTO t VALUES (1);";
        let options = LoadOptions::new("bench", dir.path().join("out"), dir.path()).with_chunk_bytes(1);
        let err = load(sql.as_bytes(), &Clock::default(), &config(), &options).unwrap_err();
        assert!(matches!(err, ArchivistError::Input { .. }));
        assert!(!dir.path().join("out").join(DATA_DIR).exists());
    }

    #[test]
    fn test_schema_errors() {
        let cases = [
            ("INSERT INTO missing VALUES (1)", 1),
            ("CREATE TABLE t (id INT PRIMARY KEY, v INT);\nINSERT INTO t VALUES (1)", 2),
            ("CREATE TABLE t (id INT PRIMARY KEY, v INT);\nINSERT INTO t VALUES ('x', 1)", 2),
            ("CREATE TABLE t (id INT PRIMARY KEY, v INT);\nINSERT INTO t VALUES (NULL, 1)", 2),
            ("CREATE TABLE t (id INT, v INT)", 1),
            ("CREATE TABLE nodb.t (id INT PRIMARY KEY)", 1),
            ("CREATE TABLE t (id INT PRIMARY KEY);\nCREATE TABLE t (id INT PRIMARY KEY)", 2),
        ];
        for (sql, statement) in cases {
            let dir = tempfile::tempdir().unwrap();
            let options = LoadOptions::new("bench", dir.path().join("out"), dir.path());
            match load(sql.as_bytes(), &Clock::default(), &config(), &options) {
                Err(ArchivistError::Input { statement: s, .. }) => assert_eq!(s, Some(statement), "{}", sql),
                other => panic!("{}: unexpected result {:?}", sql, other.map(|o| o.rows)),
            }
        }
    }

    #[test]
    fn test_explicit_timestamp_advances_clock() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Clock::default();
        let ts = clock.now().unwrap();
        let options = LoadOptions::new("bench", dir.path().join("out"), dir.path()).with_timestamp(ts);
        let outcome = load(bank(10).as_bytes(), &clock, &config(), &options).unwrap();
        assert_eq!(outcome.timestamp, ts);
        assert!(clock.now().unwrap() > ts);
    }
}
