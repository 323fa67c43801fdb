use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tidecrm_core::{JobId, WorkspaceId};
use tidecrm_events::{Subscription, WorkspaceScoped};

use crate::jobs::JobChanged;

/// Which job changes a listener is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeFilter {
    Job(JobId),
    Workspace(WorkspaceId),
    All,
}

impl ChangeFilter {
    pub fn accepts(&self, change: &JobChanged) -> bool {
        match self {
            ChangeFilter::Job(id) => change.job_id == *id,
            ChangeFilter::Workspace(ws) => change.workspace_id() == *ws,
            ChangeFilter::All => true,
        }
    }
}

/// Handle to stop and join a change listener.
#[derive(Debug)]
pub struct ListenerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ListenerHandle {
    /// Stop listening and wait for the listener thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Delivers job changes to a callback on a dedicated thread.
///
/// Only changes published after `spawn` are seen; callers that need the
/// current state read the store first.
#[derive(Debug)]
pub struct ChangeListener;

impl ChangeListener {
    pub fn spawn<H>(
        name: impl Into<String>,
        sub: Subscription<JobChanged>,
        filter: ChangeFilter,
        mut callback: H,
    ) -> std::io::Result<ListenerHandle>
    where
        H: FnMut(JobChanged) + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let join = thread::Builder::new()
            .name(name.into())
            .spawn(move || listen(sub, shutdown_rx, filter, &mut callback))?;

        Ok(ListenerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn listen<H>(sub: Subscription<JobChanged>, shutdown_rx: mpsc::Receiver<()>, filter: ChangeFilter, callback: &mut H)
where
    H: FnMut(JobChanged),
{
    let tick = Duration::from_millis(100);

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match sub.recv_timeout(tick) {
            Ok(change) => {
                if filter.accepts(&change) {
                    callback(change);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
