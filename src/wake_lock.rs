//! Screen keep-awake resource.

use log::debug;

/// A single OS-wide keep-awake handle.
pub trait ScreenWakeLock {
    fn acquire(&mut self) -> Result<(), String>;
    fn release(&mut self);
}

/// Keeps the display awake through `keepawake`. The assertion lives as long
/// as the held handle.
pub struct KeepAwakeLock {
    app_name: String,
    handle: Option<keepawake::KeepAwake>,
}

impl KeepAwakeLock {
    pub fn new(app_name: &str) -> Self {
        Self {
            app_name: app_name.to_string(),
            handle: None,
        }
    }
}

impl ScreenWakeLock for KeepAwakeLock {
    fn acquire(&mut self) -> Result<(), String> {
        if self.handle.is_some() {
            return Ok(());
        }
        let handle = keepawake::Builder::default()
            .display(true)
            .reason("Music playback")
            .app_name(self.app_name.as_str())
            .app_reverse_domain("io.nmplay")
            .create()
            .map_err(|err| err.to_string())?;
        debug!("KeepAwakeLock: acquired");
        self.handle = Some(handle);
        Ok(())
    }

    fn release(&mut self) {
        if self.handle.take().is_some() {
            debug!("KeepAwakeLock: released");
        }
    }
}
