// src/worker/child.rs

//! The worker side of the link.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt, stream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::errors::FileError;
use crate::files::{BuildFile, FileKey};
use crate::job::handle::{BucketPolicy, JobHost, JobParts, StagedOutput};
use crate::job::run::invoke;
use crate::job::{JobHandle, TaskFn};
use crate::types::{LogLevel, TaskType};

use super::WorkerLink;
use super::protocol::{Message, WireFile, WireJob, WireOutput};

/// Jobs of one batch that may wait on dependency round trips at once.
const JOB_CONCURRENCY: usize = 8;

type Reply = std::result::Result<Option<WireFile>, String>;

/// Start a worker thread serving `func` over `link`.
pub(super) fn spawn_thread(task: &str, func: TaskFn, link: WorkerLink) -> io::Result<JoinHandle<()>> {
    let name = format!("watchbuild-worker-{task}");
    std::thread::Builder::new().name(name).spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(err) => {
                error!("failed to build worker runtime: {err}");
                return;
            }
        };
        runtime.block_on(serve(func, link));
    })
}

/// What `TaskInit` told the worker about its task.
#[derive(Debug)]
struct WorkerTask {
    name: String,
    task_type: TaskType,
    policy: Arc<BucketPolicy>,
}

/// State shared by every job running on this worker.
struct Shared {
    out: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    aborted: AtomicBool,
    user_data: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Shared {
    fn send(&self, msg: &Message) {
        let sent = msg
            .encode()
            .map_err(|e| e.to_string())
            .and_then(|text| self.out.send(text).map_err(|_| "engine is gone".to_string()));
        if let Err(err) = sent {
            debug!("worker dropped a message: {err}");
        }
    }
}

/// Worker-side [`JobHost`]: every request becomes a message to the engine.
struct RemoteHost {
    shared: Arc<Shared>,
    job: String,
}

impl JobHost for RemoteHost {
    fn load(&self, key: FileKey) -> BoxFuture<'_, Result<BuildFile, FileError>> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(id, tx);
        self.shared.send(&Message::JobDepAdd {
            id,
            job: self.job.clone(),
            key: key.to_string(),
        });

        async move {
            match rx.await {
                Ok(Ok(Some(file))) => Ok(file.into_file()),
                Ok(Ok(None)) => Err(FileError::Missing(key.to_string())),
                Ok(Err(message)) => Err(FileError::io(&key, io::Error::other(message))),
                Err(_) => Err(FileError::io(
                    &key,
                    io::Error::new(io::ErrorKind::BrokenPipe, "engine went away"),
                )),
            }
        }
        .boxed()
    }

    fn dep_reset(&self, job: &str) {
        self.shared.send(&Message::JobDepReset { job: job.to_string() });
    }

    fn log(&self, level: LogLevel, job: &str, message: &str) {
        self.shared.send(&Message::Log {
            level,
            job: job.to_string(),
            message: message.to_string(),
        });
    }
}

/// Serve the link until the engine side closes it.
pub(super) async fn serve(func: TaskFn, link: WorkerLink) {
    let (out, mut rx) = link.into_parts();
    let shared = Arc::new(Shared {
        out,
        pending: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        aborted: AtomicBool::new(false),
        user_data: Mutex::new(HashMap::new()),
    });
    let mut task: Option<Arc<WorkerTask>> = None;

    while let Some(text) = rx.recv().await {
        let msg = match Message::decode(&text) {
            Ok(msg) => msg,
            Err(err) => {
                warn!("worker received an unreadable message: {err}");
                continue;
            }
        };
        match msg {
            Message::TaskInit {
                task: name,
                task_type,
                targets,
                dep_buckets,
            } => {
                debug!(task = %name, "worker initialised");
                task = Some(Arc::new(WorkerTask {
                    name,
                    task_type,
                    policy: Arc::new(BucketPolicy { targets, dep_buckets }),
                }));
            }
            Message::TaskExecute { files, jobs } => {
                let Some(task) = task.clone() else {
                    warn!("worker asked to execute before initialisation");
                    shared.send(&Message::TaskComplete);
                    continue;
                };
                shared.aborted.store(false, Ordering::SeqCst);
                tokio::spawn(execute_batch(
                    Arc::clone(&shared),
                    task,
                    func.clone(),
                    files,
                    jobs,
                ));
            }
            Message::Response { id, result } => {
                let waiter = lock(&shared.pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => warn!(id, "response for an unknown request"),
                }
            }
            Message::Abort => {
                trace!("worker batch aborted");
                shared.aborted.store(true, Ordering::SeqCst);
            }
            other => warn!(?other, "unexpected message on worker"),
        }
    }
    debug!("worker link closed");
}

async fn execute_batch(
    shared: Arc<Shared>,
    task: Arc<WorkerTask>,
    func: TaskFn,
    files: Vec<WireFile>,
    jobs: Vec<WireJob>,
) {
    let files: Vec<BuildFile> = files.into_iter().map(WireFile::into_file).collect();
    let (shared_ref, task_ref, func_ref, files_ref) = (&shared, &task, &func, files.as_slice());
    stream::iter(jobs)
        .for_each_concurrent(JOB_CONCURRENCY, move |job| {
            run_remote_job(Arc::clone(shared_ref), Arc::clone(task_ref), func_ref, files_ref, job)
        })
        .await;
    shared.send(&Message::TaskComplete);
}

async fn run_remote_job(
    shared: Arc<Shared>,
    task: Arc<WorkerTask>,
    func: &TaskFn,
    files: &[BuildFile],
    job: WireJob,
) {
    if shared.aborted.load(Ordering::SeqCst) {
        shared.send(&Message::JobDone {
            job: job.name,
            outputs: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
            deps: Default::default(),
            dep_reset: false,
            aborted: true,
        });
        return;
    }

    let job_files: Vec<BuildFile> = job.files.iter().filter_map(|&i| files.get(i).cloned()).collect();
    let updated = job
        .updated
        .iter()
        .filter_map(|&i| files.get(i))
        .map(|f| f.key().clone())
        .collect();
    let user_data = lock(&shared.user_data).remove(&job.name);

    let handle = JobHandle::new(JobParts {
        task: task.name.clone(),
        job: job.name.clone(),
        task_type: task.task_type,
        files: job_files,
        updated,
        deleted: job.deleted.iter().map(|k| FileKey::parse(k)).collect(),
        policy: Arc::clone(&task.policy),
        host: Arc::new(RemoteHost {
            shared: Arc::clone(&shared),
            job: job.name.clone(),
        }),
        user_data,
    });

    invoke(func, &handle).await;

    if let Some(data) = handle.take_user_data() {
        lock(&shared.user_data).insert(job.name.clone(), data);
    }
    let result = handle.take_result();
    let outputs = result
        .outputs
        .into_iter()
        .map(|(relative, staged)| WireOutput {
            relative,
            contents: match staged {
                StagedOutput::Contents(bytes) => Some(bytes.to_vec()),
                StagedOutput::Unchanged => None,
            },
        })
        .collect();

    shared.send(&Message::JobDone {
        job: job.name,
        outputs,
        warnings: result.warnings,
        errors: result.errors,
        deps: result.deps,
        dep_reset: result.dep_reset,
        aborted: false,
    });
}
