//! Pipeline orchestration.

use super::reader::{gate, CountingReader, Verdict};
use super::stage::{FilterStage, StageHandle};
use crate::config::{CommandSpec, FilterConfig};
use crate::error::{CoreError, CoreResult};
use bytes::Bytes;
use pgkeep_storage::{BoxedReader, Category, StorageBackend, StreamRelease};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Where a transfer reads from.
pub enum Source {
    /// Any reader.
    Reader(BoxedReader),
    /// A local file.
    File(PathBuf),
    /// The stdout of a command started with empty stdin.
    Command(CommandSpec),
    /// A stored object.
    Storage {
        /// Backend holding the object.
        backend: Arc<dyn StorageBackend>,
        /// Object name.
        name: String,
        /// Object category.
        category: Category,
    },
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Reader(_) => f.write_str("Reader"),
            Source::File(path) => f.debug_tuple("File").field(path).finish(),
            Source::Command(spec) => f.debug_tuple("Command").field(spec).finish(),
            Source::Storage { name, category, .. } => f
                .debug_struct("Storage")
                .field("name", name)
                .field("category", category)
                .finish_non_exhaustive(),
        }
    }
}

/// Where a transfer writes to.
pub enum Sink {
    /// A stored object, published only if every stage succeeds.
    Storage {
        /// Destination backend.
        backend: Arc<dyn StorageBackend>,
        /// Object name.
        name: String,
        /// Object category.
        category: Category,
    },
    /// A local file, renamed into place only if every stage succeeds.
    File(PathBuf),
    /// The stdin of a command such as `tar -x`. Its exit status is checked
    /// like any other stage.
    Command(CommandSpec),
    /// An in-memory buffer returned in [`TransferOutcome::data`].
    Memory,
}

impl fmt::Debug for Sink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sink::Storage { name, category, .. } => f
                .debug_struct("Storage")
                .field("name", name)
                .field("category", category)
                .finish_non_exhaustive(),
            Sink::File(path) => f.debug_tuple("File").field(path).finish(),
            Sink::Command(spec) => f.debug_tuple("Command").field(spec).finish(),
            Sink::Memory => f.write_str("Memory"),
        }
    }
}

/// Result of a successful transfer.
#[derive(Debug, Clone, Default)]
pub struct TransferOutcome {
    /// Bytes delivered to the sink.
    pub bytes: u64,
    /// Buffered output for [`Sink::Memory`].
    pub data: Option<Bytes>,
}

/// A chain of filter stages between a source and a sink.
///
/// # Join protocol
///
/// 1. The source is opened. A storage source returns only once its producer
///    is streaming, so no stage starts before the object is readable.
/// 2. Every stage is spawned and the sink starts consuming.
/// 3. All stderr monitors are joined, sink to source.
/// 4. All stages are waited on, sink to source. Failures are collected, not
///    short-circuited, so every process is reaped.
/// 5. The verdict opens (or fails) the sink's end of stream, the sink is
///    joined and finally the source's producer is released.
///
/// # Example
///
/// ```no_run
/// use pgkeep_core::pipeline::{Pipeline, Sink, Source};
/// use pgkeep_core::FilterConfig;
///
/// # async fn demo() -> pgkeep_core::CoreResult<()> {
/// let outcome = Pipeline::outbound(&FilterConfig::default())
///     .execute(Source::File("pg_wal/000000010000000000000001".into()), Sink::Memory)
///     .await?;
/// println!("compressed to {} bytes", outcome.bytes);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<FilterStage>,
}

type SinkTask = JoinHandle<CoreResult<Option<Bytes>>>;

impl Pipeline {
    /// Creates a pipeline without stages.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compress, then encrypt if configured.
    #[must_use]
    pub fn outbound(filters: &FilterConfig) -> Self {
        let mut pipeline =
            Self::new().stage(FilterStage::new("compress", filters.compress.clone()));
        if let Some(encrypt) = &filters.encrypt {
            pipeline = pipeline.stage(FilterStage::new("encrypt", encrypt.clone()));
        }
        pipeline
    }

    /// Decrypt if configured, then decompress.
    ///
    /// The decompressor is the terminal stage and its exit status is only
    /// logged.
    #[must_use]
    pub fn inbound(filters: &FilterConfig) -> Self {
        let mut pipeline = Self::new();
        if let Some(decrypt) = &filters.decrypt {
            pipeline = pipeline.stage(FilterStage::new("decrypt", decrypt.clone()));
        }
        pipeline.stage(FilterStage::new("decompress", filters.decompress.clone()).tolerate_exit())
    }

    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, stage: FilterStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// The stages in data-flow order.
    #[must_use]
    pub fn stages(&self) -> &[FilterStage] {
        &self.stages
    }

    /// Runs the pipeline to completion.
    ///
    /// # Errors
    ///
    /// Returns the first failure in sink-to-source order. For storage and
    /// file sinks an error guarantees that nothing was published.
    pub async fn execute(&self, source: Source, sink: Sink) -> CoreResult<TransferOutcome> {
        debug!(?source, ?sink, stages = self.stages.len(), "starting transfer");
        let (mut reader, mut handles, release) = open_source(source).await?;

        for stage in &self.stages {
            match stage.run(reader) {
                Ok((output, handle)) => {
                    handles.push(handle);
                    reader = output;
                }
                Err(err) => return Err(abandon(err, handles, release).await),
            }
        }

        let (counted, count) = CountingReader::new(reader);
        let (verdict, sink_task) = match start_sink(sink, Box::new(counted), &mut handles) {
            Ok(started) => started,
            Err(err) => return Err(abandon(err, handles, release).await),
        };

        let mut failure = join_stages(handles).await;
        // The producer of a storage source must finish cleanly before the
        // sink may publish; a truncated body looks like a clean EOF downstream.
        if let Some(release) = release {
            if let Err(err) = release.wait().await {
                warn!(error = %err, "source producer failed");
                failure.get_or_insert(CoreError::from(err));
            }
        }

        // A gated sink can only finish before the verdict by failing on its own.
        let sink_failed_first = verdict.is_some() && sink_task.is_finished();
        if let Some(verdict) = verdict {
            let message: Verdict = match &failure {
                None => Ok(()),
                Some(err) => Err(err.to_string()),
            };
            let _ = verdict.send(message);
        }
        let sink_result = sink_task
            .await
            .map_err(|err| CoreError::pipeline(format!("sink task failed: {err}")))
            .and_then(|result| result);

        match (failure, sink_result) {
            (Some(stage_err), Err(sink_err)) if sink_failed_first => {
                warn!(error = %stage_err, "stage failed after sink error");
                Err(sink_err)
            }
            (Some(stage_err), _) => Err(stage_err),
            (None, Err(sink_err)) => Err(sink_err),
            (None, Ok(data)) => {
                let bytes = count.load(Ordering::Relaxed);
                debug!(bytes, "transfer complete");
                Ok(TransferOutcome { bytes, data })
            }
        }
    }
}

/// Drains every stage sink-side first, then waits them all.
///
/// Returns the first failure in sink-to-source order.
async fn join_stages(handles: Vec<StageHandle>) -> Option<CoreError> {
    let mut drained = Vec::with_capacity(handles.len());
    for handle in handles.into_iter().rev() {
        drained.push(handle.drain().await);
    }
    let mut failure: Option<CoreError> = None;
    for stage in drained {
        let name = stage.name().to_string();
        if let Err(err) = stage.wait().await {
            warn!(stage = %name, error = %err, "stage failed");
            failure.get_or_insert(err);
        }
    }
    failure
}

/// Joins everything already started when a later stage could not start.
///
/// The reader that would have fed the missing stage is already dropped, so
/// upstream programs see a closed pipe and exit.
async fn abandon(
    err: CoreError,
    handles: Vec<StageHandle>,
    release: Option<StreamRelease>,
) -> CoreError {
    warn!(error = %err, started = handles.len(), "transfer aborted before it began");
    if let Some(stage_err) = join_stages(handles).await {
        debug!(error = %stage_err, "started stage failed during abort");
    }
    if let Some(release) = release {
        if let Err(release_err) = release.wait().await {
            debug!(error = %release_err, "source producer failed during abort");
        }
    }
    err
}

async fn open_source(
    source: Source,
) -> CoreResult<(BoxedReader, Vec<StageHandle>, Option<StreamRelease>)> {
    match source {
        Source::Reader(reader) => Ok((reader, Vec::new(), None)),
        Source::File(path) => {
            let file = File::open(&path).await.map_err(|err| {
                CoreError::Io(std::io::Error::new(
                    err.kind(),
                    format!("{}: {err}", path.display()),
                ))
            })?;
            Ok((Box::new(file), Vec::new(), None))
        }
        Source::Command(spec) => {
            let (output, handle) =
                FilterStage::new("source", spec).run(Box::new(tokio::io::empty()))?;
            Ok((output, vec![handle], None))
        }
        Source::Storage {
            backend,
            name,
            category,
        } => {
            let stream = backend.open_stream(&name, category).await?;
            debug!(object = %name, size = stream.size, "source object opened");
            Ok((stream.reader, Vec::new(), Some(stream.release)))
        }
    }
}

fn start_sink(
    sink: Sink,
    reader: BoxedReader,
    handles: &mut Vec<StageHandle>,
) -> CoreResult<(Option<oneshot::Sender<Verdict>>, SinkTask)> {
    match sink {
        Sink::Storage {
            backend,
            name,
            category,
        } => {
            let (verdict, gated) = gate(reader);
            let task = tokio::spawn(async move {
                backend.write_stream(Box::new(gated), &name, category).await?;
                Ok::<_, CoreError>(None)
            });
            Ok((Some(verdict), task))
        }
        Sink::File(path) => {
            let (verdict, gated) = gate(reader);
            let task = tokio::spawn(async move {
                write_file_atomic(&path, Box::new(gated)).await?;
                Ok::<_, CoreError>(None)
            });
            Ok((Some(verdict), task))
        }
        Sink::Command(spec) => {
            let (mut output, handle) = FilterStage::new("sink", spec).run(reader)?;
            handles.push(handle);
            let task = tokio::spawn(async move {
                tokio::io::copy(&mut output, &mut tokio::io::sink()).await?;
                Ok::<_, CoreError>(None)
            });
            Ok((None, task))
        }
        Sink::Memory => {
            let mut reader = reader;
            let task = tokio::spawn(async move {
                let mut data = Vec::new();
                reader.read_to_end(&mut data).await?;
                Ok::<_, CoreError>(Some(Bytes::from(data)))
            });
            Ok((None, task))
        }
    }
}

/// Writes `source` to a hidden sibling of `path` and renames it into place.
async fn write_file_atomic(path: &Path, mut source: BoxedReader) -> CoreResult<u64> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| CoreError::pipeline(format!("{} is not a file path", path.display())))?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).await?;
    let temp = dir.join(format!(".{file_name}.{}.partial", Uuid::new_v4().simple()));

    let written = async {
        let mut file = File::create(&temp).await?;
        let written = tokio::io::copy(&mut source, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok::<_, std::io::Error>(written)
    }
    .await;

    match written {
        Ok(written) => {
            if let Err(err) = fs::rename(&temp, path).await {
                let _ = fs::remove_file(&temp).await;
                return Err(err.into());
            }
            Ok(written)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp).await;
            Err(err.into())
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pgkeep_storage::{
        BackendKind, InMemoryBackend, ObjectInfo, ObjectStream, StorageError, StorageResult,
    };
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// Accepts uploads the way a multipart client does, a few bytes at a time.
    #[derive(Default)]
    struct ChunkedBackend {
        stored: Mutex<Vec<u8>>,
        chunks: Mutex<usize>,
    }

    #[async_trait]
    impl StorageBackend for ChunkedBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::ObjectStore
        }

        async fn write_stream(
            &self,
            mut source: BoxedReader,
            _name: &str,
            _category: Category,
        ) -> StorageResult<u64> {
            let mut total = 0;
            loop {
                let mut chunk = Vec::new();
                (&mut source).take(4).read_to_end(&mut chunk).await?;
                if chunk.is_empty() {
                    break;
                }
                total += chunk.len() as u64;
                *self.chunks.lock().unwrap() += 1;
                self.stored.lock().unwrap().extend_from_slice(&chunk);
            }
            Ok(total)
        }

        async fn open_stream(&self, name: &str, category: Category) -> StorageResult<ObjectStream> {
            Err(StorageError::not_found(category, name))
        }

        async fn list(&self, _category: Category) -> StorageResult<Vec<ObjectInfo>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _name: &str, _category: Category) -> StorageResult<()> {
            Ok(())
        }
    }

    /// Serves a body whose producer fails after a few bytes.
    struct TruncatingBackend;

    #[async_trait]
    impl StorageBackend for TruncatingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::ObjectStore
        }

        async fn write_stream(
            &self,
            _source: BoxedReader,
            name: &str,
            _category: Category,
        ) -> StorageResult<u64> {
            Err(StorageError::ObjectStore(format!("{name}: read only")))
        }

        async fn open_stream(
            &self,
            _name: &str,
            _category: Category,
        ) -> StorageResult<ObjectStream> {
            let (reader, mut writer) = tokio::io::duplex(64);
            let producer = tokio::spawn(async move {
                writer.write_all(b"partial").await?;
                drop(writer);
                Err(StorageError::ObjectStore("connection reset mid-body".into()))
            });
            Ok(ObjectStream {
                reader: Box::new(reader),
                size: 4096,
                content_type: None,
                release: StreamRelease::from_task(producer),
            })
        }

        async fn list(&self, _category: Category) -> StorageResult<Vec<ObjectInfo>> {
            Ok(Vec::new())
        }

        async fn delete(&self, _name: &str, _category: Category) -> StorageResult<()> {
            Ok(())
        }
    }

    fn cat() -> CommandSpec {
        CommandSpec::new("cat", Vec::<String>::new())
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c", script])
    }

    #[tokio::test]
    async fn reader_through_two_stages_to_memory() {
        let pipeline = Pipeline::new()
            .stage(FilterStage::new("one", cat()))
            .stage(FilterStage::new("upper", CommandSpec::new("tr", ["a-z", "A-Z"])));

        let outcome = pipeline
            .execute(Source::Reader(Box::new(&b"hello"[..])), Sink::Memory)
            .await
            .unwrap();
        assert_eq!(outcome.data.unwrap(), Bytes::from_static(b"HELLO"));
        assert_eq!(outcome.bytes, 5);
    }

    #[tokio::test]
    async fn storage_round_trip() {
        let backend = Arc::new(InMemoryBackend::new());
        let pipeline = Pipeline::new().stage(FilterStage::new("compress", cat()));

        pipeline
            .execute(
                Source::Reader(Box::new(&b"segment"[..])),
                Sink::Storage {
                    backend: backend.clone(),
                    name: "000000010000000000000001".into(),
                    category: Category::Wal,
                },
            )
            .await
            .unwrap();
        assert!(backend.contains("000000010000000000000001", Category::Wal));

        let outcome = Pipeline::new()
            .stage(FilterStage::new("decompress", cat()).tolerate_exit())
            .execute(
                Source::Storage {
                    backend: backend.clone(),
                    name: "000000010000000000000001".into(),
                    category: Category::Wal,
                },
                Sink::Memory,
            )
            .await
            .unwrap();
        assert_eq!(outcome.data.unwrap(), Bytes::from_static(b"segment"));
    }

    #[tokio::test]
    async fn failing_last_stage_publishes_nothing() {
        let backend = Arc::new(InMemoryBackend::new());
        let pipeline = Pipeline::new()
            .stage(FilterStage::new("compress", cat()))
            .stage(FilterStage::new("encrypt", sh("cat; exit 4")));

        let err = pipeline
            .execute(
                Source::Reader(Box::new(&b"secret"[..])),
                Sink::Storage {
                    backend: backend.clone(),
                    name: "obj".into(),
                    category: Category::Basebackup,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::StageFailed { ref stage, code: Some(4), .. } if stage == "encrypt"
        ));
        assert!(!backend.contains("obj", Category::Basebackup));
    }

    #[tokio::test]
    async fn file_sink_is_atomic() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out").join("000000010000000000000002");

        let err = Pipeline::new()
            .stage(FilterStage::new("decrypt", sh("cat; exit 2")))
            .execute(Source::Reader(Box::new(&b"bytes"[..])), Sink::File(target.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StageFailed { .. }));
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(target.parent().unwrap()).unwrap().count(), 0);

        Pipeline::new()
            .stage(FilterStage::new("decrypt", cat()))
            .execute(Source::Reader(Box::new(&b"bytes"[..])), Sink::File(target.clone()))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"bytes");
    }

    #[tokio::test]
    async fn command_source_and_sink() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("written");
        let sink = sh(&format!("cat > {}", out.display()));

        Pipeline::new()
            .stage(FilterStage::new("compress", cat()))
            .execute(Source::Command(sh("printf basebackup")), Sink::Command(sink))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"basebackup");
    }

    #[tokio::test]
    async fn failing_command_sink_fails_transfer() {
        let err = Pipeline::new()
            .execute(
                Source::Reader(Box::new(&b"tarball"[..])),
                Sink::Command(sh("cat >/dev/null; exit 9")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::StageFailed { ref stage, .. } if stage == "sink"));
    }

    #[tokio::test]
    async fn tolerated_decompressor() {
        let filters = FilterConfig::default().compression(cat(), sh("cat; exit 1"), ".raw");
        let outcome = Pipeline::inbound(&filters)
            .execute(Source::Reader(Box::new(&b"label"[..])), Sink::Memory)
            .await
            .unwrap();
        assert_eq!(outcome.data.unwrap(), Bytes::from_static(b"label"));
    }

    #[tokio::test]
    async fn missing_source_object_fails_before_stages() {
        let backend = Arc::new(InMemoryBackend::new());
        let err = Pipeline::new()
            .stage(FilterStage::new("decompress", cat()))
            .execute(
                Source::Storage {
                    backend,
                    name: "absent".into(),
                    category: Category::Wal,
                },
                Sink::Memory,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Storage(ref e) if e.is_not_found()));
    }

    #[tokio::test]
    async fn chunked_upload_sees_one_clean_eof() {
        let backend = Arc::new(ChunkedBackend::default());
        let outcome = Pipeline::new()
            .stage(FilterStage::new("compress", cat()))
            .execute(
                Source::Reader(Box::new(&b"0123456789"[..])),
                Sink::Storage {
                    backend: backend.clone(),
                    name: "obj".into(),
                    category: Category::Basebackup,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.bytes, 10);
        assert_eq!(*backend.stored.lock().unwrap(), b"0123456789");
        assert_eq!(*backend.chunks.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn truncated_source_body_is_not_published() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("RECOVERYXLOG");

        let err = Pipeline::new()
            .stage(FilterStage::new("decrypt", cat()))
            .execute(
                Source::Storage {
                    backend: Arc::new(TruncatingBackend),
                    name: "000000010000000000000003".into(),
                    category: Category::Wal,
                },
                Sink::File(target.clone()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Storage(StorageError::ObjectStore(_))));
        assert!(!target.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn truncated_source_body_fails_memory_sink() {
        let err = Pipeline::new()
            .execute(
                Source::Storage {
                    backend: Arc::new(TruncatingBackend),
                    name: "label".into(),
                    category: Category::Wal,
                },
                Sink::Memory,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Storage(_)));
    }

    #[tokio::test]
    async fn unstartable_stage_joins_started_ones() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.insert("000000010000000000000004", Category::Wal, vec![7u8; 256 * 1024]);

        let err = Pipeline::new()
            .stage(FilterStage::new("decrypt", cat()))
            .stage(FilterStage::new(
                "decompress",
                CommandSpec::new("pgkeep-no-such-program", Vec::<String>::new()),
            ))
            .execute(
                Source::Storage {
                    backend,
                    name: "000000010000000000000004".into(),
                    category: Category::Wal,
                },
                Sink::Memory,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Pipeline { ref message } if message.contains("decompress")
        ));
    }

    #[tokio::test]
    async fn unstartable_command_sink_joins_stages() {
        let err = Pipeline::new()
            .stage(FilterStage::new("compress", cat()))
            .execute(
                Source::Command(sh("head -c 262144 /dev/zero")),
                Sink::Command(CommandSpec::new("pgkeep-no-such-program", Vec::<String>::new())),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Pipeline { ref message } if message.contains("sink")));
    }

    #[tokio::test]
    async fn concurrent_file_sinks_to_one_path() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("base.tar");
        let pipeline = Pipeline::new().stage(FilterStage::new("decompress", cat()));

        let (first, second) = tokio::join!(
            pipeline.execute(Source::Reader(Box::new(&b"first"[..])), Sink::File(target.clone())),
            pipeline.execute(Source::Reader(Box::new(&b"second"[..])), Sink::File(target.clone())),
        );
        first.unwrap();
        second.unwrap();
        let written = std::fs::read(&target).unwrap();
        assert!(written == b"first" || written == b"second");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn outbound_and_inbound_stage_order() {
        let filters = FilterConfig::default().encryption(cat(), cat());
        let out: Vec<_> = Pipeline::outbound(&filters)
            .stages()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(out, vec!["compress", "encrypt"]);
        let inbound: Vec<_> = Pipeline::inbound(&filters)
            .stages()
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(inbound, vec!["decrypt", "decompress"]);
    }
}
