//! Editor window thread.
//!
//! Some modules must create their GUI on the thread that runs its message
//! loop, so when a session opens a module with an editor, the instance is
//! created on a dedicated thread that then owns the window and blocks in
//! [`Window::run`] until the window is closed. The instance is handed back
//! to that thread to close its editor before it is released.

use consort_core::{HostError, PluginInstance, Result, Window, WindowSystem};
use crossbeam::channel;
use std::sync::Arc;
use std::thread;

type Setup = Result<(Option<Arc<dyn Window>>, Box<dyn PluginInstance>)>;
type Handoff = Box<dyn PluginInstance>;

pub struct EditorThread {
    window: Arc<dyn Window>,
    handle: Option<thread::JoinHandle<()>>,
    closing: Option<channel::Sender<Handoff>>,
    closed: channel::Receiver<Handoff>,
}

impl EditorThread {
    /// Create the instance on a new thread and open its editor there.
    ///
    /// Returns no thread if the module turned out to have no editor (or it
    /// failed to open); the instance is usable either way.
    pub fn spawn<F>(
        windows: Arc<dyn WindowSystem>,
        title: String,
        make: F,
    ) -> Result<(Option<Self>, Box<dyn PluginInstance>)>
    where
        F: FnOnce() -> Result<Box<dyn PluginInstance>> + Send + 'static,
    {
        let (tx, rx) = channel::bounded::<Setup>(1);
        let (closing, close_rx) = channel::bounded::<Handoff>(1);
        let (closed_tx, closed) = channel::bounded::<Handoff>(1);
        let handle = thread::Builder::new()
            .name("consort-editor".to_string())
            .spawn(move || {
                let mut instance = match make() {
                    Ok(instance) => instance,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                if !instance.has_editor() {
                    let _ = tx.send(Ok((None, instance)));
                    return;
                }
                let window = match windows.create_window() {
                    Ok(window) => window,
                    Err(e) => {
                        tracing::warn!("Cannot create editor window for {}: {}", title, e);
                        let _ = tx.send(Ok((None, instance)));
                        return;
                    }
                };
                if let Err(e) = instance.open_editor(&*window) {
                    tracing::warn!("Editor of {} failed to open: {}", title, e);
                    let _ = tx.send(Ok((None, instance)));
                    return;
                }
                window.set_title(&title);
                if let Some(rect) = instance.editor_rect() {
                    window.set_geometry(rect);
                }
                if tx.send(Ok((Some(Arc::clone(&window)), instance))).is_ok() {
                    window.run();
                    if let Ok(mut instance) = close_rx.recv() {
                        instance.close_editor();
                        let _ = closed_tx.send(instance);
                    }
                }
                tracing::debug!("Editor loop of {} finished", title);
            })
            .map_err(|e| HostError::Editor(format!("cannot spawn editor thread: {}", e)))?;

        match rx.recv() {
            Ok(Ok((Some(window), instance))) => Ok((
                Some(Self {
                    window,
                    handle: Some(handle),
                    closing: Some(closing),
                    closed,
                }),
                instance,
            )),
            Ok(Ok((None, instance))) => {
                let _ = handle.join();
                Ok((None, instance))
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(HostError::Editor("editor thread exited during setup".into()))
            }
        }
    }

    pub fn show(&self, visible: bool) {
        if visible {
            self.window.show();
            self.window.bring_to_top();
        } else {
            self.window.hide();
        }
    }

    /// Quit the message loop, close the editor of `instance` on the editor
    /// thread and wait for the thread.
    ///
    /// Returns `None` if the editor thread lost the instance.
    pub fn close(&mut self, instance: Handoff) -> Option<Handoff> {
        let (Some(handle), Some(closing)) = (self.handle.take(), self.closing.take()) else {
            return Some(instance);
        };
        self.window.quit();
        let instance = match closing.send(instance) {
            Ok(()) => self.closed.recv().ok(),
            Err(channel::SendError(mut instance)) => {
                tracing::warn!("Editor thread is gone, closing the editor here");
                instance.close_editor();
                Some(instance)
            }
        };
        let _ = handle.join();
        instance
    }
}

impl Drop for EditorThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.closing = None;
            self.window.quit();
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for EditorThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorThread")
            .field("running", &self.handle.is_some())
            .finish()
    }
}
