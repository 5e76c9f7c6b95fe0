//! In-memory leader and instrumented host for tests

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use tokio::sync::Notify;

use crate::checksum::checksum_of;
use crate::error::{Error, Result};
use crate::host::{DirectoryHost, IndexHost};
use crate::protocol::{
    CommitPoint, FileDescriptor, FileKind, FileList, FileRequest, PacketWriter, CMD_FILE_CONTENT,
};
use crate::session::AbortSignal;
use crate::transport::{ByteStream, LeaderTransport};

#[derive(Debug, Clone)]
enum Fault {
    /// Flip a payload byte of packet `packet`
    Corrupt { file: String, packet: usize, times: u32 },
    /// End the response body before packet `packet`, without a terminator
    Cut { file: String, packet: usize, times: u32 },
    /// Send a terminator instead of packet `packet`
    EndEarly { file: String, packet: usize },
}

/// Leader serving files from memory, with fault injection
pub struct MockLeader {
    commit: Mutex<CommitPoint>,
    index: Mutex<Vec<(FileDescriptor, Bytes)>>,
    conf: Mutex<Vec<(FileDescriptor, Bytes)>>,
    packet_size: usize,
    faults: Mutex<Vec<Fault>>,
    requests: Mutex<Vec<FileRequest>>,
    abort_hook: Mutex<Option<(u64, AbortSignal)>>,
    offline: AtomicBool,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockLeader {
    pub fn new(version: i64, generation: i64) -> Self {
        Self {
            commit: Mutex::new(CommitPoint::new(version, generation)),
            index: Mutex::new(Vec::new()),
            conf: Mutex::new(Vec::new()),
            packet_size: 1024,
            faults: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            abort_hook: Mutex::new(None),
            offline: AtomicBool::new(false),
            gate: Mutex::new(None),
        }
    }

    pub fn with_packet_size(mut self, packet_size: usize) -> Self {
        self.packet_size = packet_size;
        self
    }

    pub fn set_commit(&self, commit: CommitPoint) {
        *self.commit.lock().unwrap() = commit;
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Hold commit-info requests until the returned gate is notified
    pub fn hold(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn add_index_file(&self, name: &str, data: &[u8], last_modified: i64) {
        let desc = FileDescriptor::new(name, data.len() as u64, last_modified);
        upsert(&mut self.index.lock().unwrap(), desc, data);
    }

    pub fn add_conf_file(&self, name: &str, data: &[u8], alias: Option<&str>) {
        let mut desc = FileDescriptor::new(name, data.len() as u64, 1_700_000_000_000)
            .with_checksum(checksum_of(data) as i64);
        if let Some(alias) = alias {
            desc = desc.with_alias(alias);
        }
        upsert(&mut self.conf.lock().unwrap(), desc, data);
    }

    pub fn remove_file(&self, name: &str) {
        self.index.lock().unwrap().retain(|(d, _)| d.name != name);
        self.conf.lock().unwrap().retain(|(d, _)| d.name != name);
    }

    pub fn descriptor(&self, name: &str) -> Option<FileDescriptor> {
        let index = self.index.lock().unwrap();
        let conf = self.conf.lock().unwrap();
        index
            .iter()
            .chain(conf.iter())
            .find(|(d, _)| d.name == name)
            .map(|(d, _)| d.clone())
    }

    pub fn corrupt_packet(&self, file: &str, packet: usize, times: u32) {
        self.faults.lock().unwrap().push(Fault::Corrupt {
            file: file.into(),
            packet,
            times,
        });
    }

    pub fn cut_stream(&self, file: &str, packet: usize, times: u32) {
        self.faults.lock().unwrap().push(Fault::Cut {
            file: file.into(),
            packet,
            times,
        });
    }

    pub fn end_early(&self, file: &str, packet: usize) {
        self.faults.lock().unwrap().push(Fault::EndEarly {
            file: file.into(),
            packet,
        });
    }

    /// Raise `signal` once `bytes` of payload have been handed out
    pub fn abort_after(&self, bytes: u64, signal: AbortSignal) {
        *self.abort_hook.lock().unwrap() = Some((bytes, signal));
    }

    /// Every file-content request received so far
    pub fn requests(&self) -> Vec<FileRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Names of files requested, in order, without repeats for retries
    pub fn requested_files(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for request in self.requests() {
            if names.last() != Some(&request.name) {
                names.push(request.name);
            }
        }
        names
    }

    fn content(&self, request: &FileRequest) -> Option<Bytes> {
        let files = match request.kind {
            FileKind::Index => self.index.lock().unwrap(),
            FileKind::Conf => self.conf.lock().unwrap(),
        };
        files
            .iter()
            .find(|(d, _)| d.name == request.name)
            .map(|(_, data)| data.clone())
    }

    fn frame(&self, request: &FileRequest, data: &[u8]) -> Vec<(Bytes, u64)> {
        let writer = PacketWriter::new(self.packet_size, request.checksum);
        let offset = (request.offset as usize).min(data.len());
        let first = offset / self.packet_size;
        let mut faults = self.faults.lock().unwrap();
        let mut chunks = Vec::new();

        if offset == data.len() {
            let mut buf = BytesMut::new();
            writer.encode_end(&mut buf);
            return vec![(buf.freeze(), 0)];
        }

        for (i, payload) in data[offset..].chunks(self.packet_size).enumerate() {
            let packet = first + i;
            let mut corrupt = false;
            let mut stop = false;

            for fault in faults.iter_mut() {
                match fault {
                    Fault::Cut { file, packet: p, times }
                        if *file == request.name && *p == packet && *times > 0 =>
                    {
                        *times -= 1;
                        stop = true;
                    }
                    Fault::EndEarly { file, packet: p } if *file == request.name && *p == packet => {
                        let mut buf = BytesMut::new();
                        writer.encode_end(&mut buf);
                        chunks.push((buf.freeze(), 0));
                        stop = true;
                    }
                    Fault::Corrupt { file, packet: p, times }
                        if *file == request.name && *p == packet && *times > 0 =>
                    {
                        *times -= 1;
                        corrupt = true;
                    }
                    _ => {}
                }
            }
            if stop {
                break;
            }

            let mut buf = BytesMut::new();
            writer.encode_packet(&mut buf, payload);
            if corrupt {
                let last = buf.len() - 1;
                buf[last] ^= 0xFF;
            }
            chunks.push((buf.freeze(), payload.len() as u64));
        }

        chunks
    }
}

fn upsert(files: &mut Vec<(FileDescriptor, Bytes)>, desc: FileDescriptor, data: &[u8]) {
    files.retain(|(d, _)| d.name != desc.name);
    files.push((desc, Bytes::copy_from_slice(data)));
}

#[async_trait]
impl LeaderTransport for MockLeader {
    async fn commit_info(&self) -> Result<CommitPoint> {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(Error::Transport("connection refused".into()));
        }
        Ok(*self.commit.lock().unwrap())
    }

    async fn file_list(&self, _version: i64) -> Result<FileList> {
        Ok(FileList {
            files: self.index.lock().unwrap().iter().map(|(d, _)| d.clone()).collect(),
            conf_files: self.conf.lock().unwrap().iter().map(|(d, _)| d.clone()).collect(),
        })
    }

    async fn open_file(&self, request: &FileRequest) -> Result<ByteStream> {
        self.requests.lock().unwrap().push(request.clone());

        let data = self.content(request).ok_or(Error::LeaderStatus {
            status: 404,
            command: CMD_FILE_CONTENT,
        })?;
        let chunks = self.frame(request, &data);
        let hook = self.abort_hook.lock().unwrap().clone();
        let mut served = request.offset;

        Ok(stream::iter(chunks)
            .map(move |(bytes, payload_len)| {
                served += payload_len;
                if let Some((limit, signal)) = &hook {
                    if served >= *limit {
                        signal.raise();
                    }
                }
                Ok(bytes)
            })
            .boxed())
    }

    fn leader(&self) -> String {
        "mock://leader".into()
    }
}

/// Directory host that counts commits and reloads
pub struct RecordingHost {
    inner: DirectoryHost,
    pub commits: AtomicUsize,
    pub reloads: AtomicUsize,
    reloaded: Notify,
    fail_reload: AtomicBool,
    reload_gate: Mutex<Option<Arc<Notify>>>,
}

impl RecordingHost {
    pub fn open(data_dir: &Path) -> Self {
        Self {
            inner: DirectoryHost::open(data_dir, data_dir.join("conf")).unwrap(),
            commits: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
            reloaded: Notify::new(),
            fail_reload: AtomicBool::new(false),
            reload_gate: Mutex::new(None),
        }
    }

    /// Make reloads wait until the returned gate is notified
    pub fn hold_reload(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.reload_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn fail_reload(&self) {
        self.fail_reload.store(true, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    /// Wait for a reload issued in the background
    pub async fn wait_for_reload(&self) {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.reloaded.notified())
            .await
            .expect("reload was never issued");
    }

    /// Seed the local commit point
    pub async fn seed(&self, commit: CommitPoint) {
        self.inner.commit(commit).await.unwrap();
    }
}

#[async_trait]
impl IndexHost for RecordingHost {
    async fn commit_point(&self) -> Result<CommitPoint> {
        self.inner.commit_point().await
    }

    fn data_dir(&self) -> PathBuf {
        self.inner.data_dir()
    }

    fn index_dir(&self) -> PathBuf {
        self.inner.index_dir()
    }

    fn conf_dir(&self) -> PathBuf {
        self.inner.conf_dir()
    }

    async fn commit(&self, installed: CommitPoint) -> Result<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        self.inner.commit(installed).await
    }

    async fn reload(&self, installed: CommitPoint) -> Result<()> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        let gate = self.reload_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let result = if self.fail_reload.load(Ordering::SeqCst) {
            Err(Error::Host("reload refused".into()))
        } else {
            self.inner.reload(installed).await
        };
        self.reloaded.notify_one();
        result
    }
}

/// File names directly inside `dir`, sorted
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
