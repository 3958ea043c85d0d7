//! Panel-specific frame insertion schedules supplied by a dynamically loaded plugin.
//!
//! The plugin is a shared object exporting `createExternalEventHandler` and
//! `destroyExternalEventHandler`. Its events are copied into the controller's own queue, so
//! nothing the plugin returns is referenced after the call.

use std::ffi::{c_char, c_void, CStr, CString};
use std::path::Path;
use std::ptr;

use anyhow::{bail, ensure, Context};

/// Command sent to the panel when a scheduled event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelCommand {
    /// Ask the DDIC to repeat the last frame.
    FrameInsertion { frames: u32 },
    Te2Rate { hz: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedEvent {
    pub when_ns: i64,
    /// `when_ns` is relative to the time the schedule starts.
    pub is_relative: bool,
    pub command: PanelCommand,
}

impl TimedEvent {
    pub fn deadline(&self, start_ns: i64) -> i64 {
        if self.is_relative {
            start_ns.saturating_add(self.when_ns)
        } else {
            self.when_ns
        }
    }
}

pub trait ExternalEventHandler: Send {
    fn name(&self) -> &str;

    /// Events to schedule once a vendor rendering timeout expires.
    fn get_handle_events(&mut self) -> Vec<TimedEvent>;
}

const CREATE_SYMBOL: &CStr = c"createExternalEventHandler";
const DESTROY_SYMBOL: &CStr = c"destroyExternalEventHandler";
const MAX_EVENTS: usize = 64;

pub const RAW_EVENT_FRAME_INSERTION: u32 = 0;
pub const RAW_EVENT_TE2_RATE: u32 = 1;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RawTimedEvent {
    pub when_ns: i64,
    pub is_relative: u8,
    pub kind: u32,
    /// Frame count or rate in Hz, depending on `kind`.
    pub value: u32,
}

impl RawTimedEvent {
    fn to_event(self) -> Option<TimedEvent> {
        let command = match self.kind {
            RAW_EVENT_FRAME_INSERTION => PanelCommand::FrameInsertion { frames: self.value },
            RAW_EVENT_TE2_RATE => PanelCommand::Te2Rate { hz: self.value },
            kind => {
                warn!("ignoring plugin event of unknown kind {kind}");
                return None;
            }
        };
        Some(TimedEvent {
            when_ns: self.when_ns,
            is_relative: self.is_relative != 0,
            command,
        })
    }
}

pub type GetHandleEventsFn =
    unsafe extern "C" fn(ctx: *mut c_void, events: *mut RawTimedEvent, capacity: usize) -> usize;

/// Handler object owned by the plugin.
#[repr(C)]
pub struct RawExternalEventHandler {
    pub ctx: *mut c_void,
    pub get_handle_events: Option<GetHandleEventsFn>,
}

type CreateFn = unsafe extern "C" fn(
    interface: *mut c_void,
    host: *mut c_void,
    panel_name: *const c_char,
) -> *mut RawExternalEventHandler;
type DestroyFn = unsafe extern "C" fn(handler: *mut RawExternalEventHandler);

/// Copies the plugin's events out of `raw`.
///
/// # Safety
///
/// `raw` must point to a live handler whose callback honors `capacity`.
unsafe fn collect_events(raw: *mut RawExternalEventHandler) -> Vec<TimedEvent> {
    let Some(get) = (*raw).get_handle_events else {
        return Vec::new();
    };

    let mut buf = [RawTimedEvent::default(); MAX_EVENTS];
    let count = get((*raw).ctx, buf.as_mut_ptr(), buf.len()).min(MAX_EVENTS);
    buf[..count].iter().filter_map(|e| e.to_event()).collect()
}

fn dl_error() -> String {
    // SAFETY: dlerror returns null or a valid C string owned by libc.
    unsafe {
        let err = libc::dlerror();
        if err.is_null() {
            String::from("unknown error")
        } else {
            CStr::from_ptr(err).to_string_lossy().into_owned()
        }
    }
}

/// Loaded plugin. Destroys the handler and unloads the library on drop.
pub struct ExternalEventHandlerLoader {
    name: String,
    library: *mut c_void,
    handler: *mut RawExternalEventHandler,
    destroy: DestroyFn,
}

// SAFETY: the plugin handler is only called from whichever thread currently owns the loader,
// and the plugin contract forbids thread affinity.
unsafe impl Send for ExternalEventHandlerLoader {}

impl ExternalEventHandlerLoader {
    pub fn load(path: &Path, panel_name: &str) -> anyhow::Result<Self> {
        let _span = tracy_client::span!("ExternalEventHandlerLoader::load");

        let c_path = CString::new(path.as_os_str().as_encoded_bytes())
            .context("plugin path contains a nul byte")?;
        let c_panel = CString::new(panel_name).context("panel name contains a nul byte")?;

        // SAFETY: c_path is a valid C string.
        let library = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if library.is_null() {
            bail!("error loading {path:?}: {}", dl_error());
        }

        // SAFETY: library is a live handle; it is closed below if creation fails.
        let result = unsafe { Self::create(library, &c_panel) };
        match result {
            Ok((handler, destroy)) => {
                info!("loaded external event handler {path:?} for {panel_name}");
                Ok(Self {
                    name: path.display().to_string(),
                    library,
                    handler,
                    destroy,
                })
            }
            Err(err) => {
                // SAFETY: library came from a successful dlopen.
                unsafe { libc::dlclose(library) };
                Err(err.context(format!("error initializing {path:?}")))
            }
        }
    }

    unsafe fn create(
        library: *mut c_void,
        panel_name: &CStr,
    ) -> anyhow::Result<(*mut RawExternalEventHandler, DestroyFn)> {
        let create = libc::dlsym(library, CREATE_SYMBOL.as_ptr());
        let destroy = libc::dlsym(library, DESTROY_SYMBOL.as_ptr());
        ensure!(!create.is_null(), "missing {CREATE_SYMBOL:?}: {}", dl_error());
        ensure!(!destroy.is_null(), "missing {DESTROY_SYMBOL:?}: {}", dl_error());

        let create: CreateFn = std::mem::transmute::<*mut c_void, CreateFn>(create);
        let destroy: DestroyFn = std::mem::transmute::<*mut c_void, DestroyFn>(destroy);

        // The plugin gets no host interface.
        let handler = create(ptr::null_mut(), ptr::null_mut(), panel_name.as_ptr());
        ensure!(!handler.is_null(), "createExternalEventHandler returned null");
        Ok((handler, destroy))
    }
}

impl ExternalEventHandler for ExternalEventHandlerLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn get_handle_events(&mut self) -> Vec<TimedEvent> {
        // SAFETY: handler stays valid until drop.
        unsafe { collect_events(self.handler) }
    }
}

impl Drop for ExternalEventHandlerLoader {
    fn drop(&mut self) {
        // SAFETY: handler came from the library's create function and is destroyed exactly
        // once, before the library is unloaded.
        unsafe {
            (self.destroy)(self.handler);
            if libc::dlclose(self.library) != 0 {
                warn!("error unloading {}: {}", self.name, dl_error());
            }
        }
    }
}

/// Fixed schedule of frame insertions, used to replace the plugin's schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentTimeoutOverride {
    /// Delay between the last present and the first scheduled frame insertion batch.
    pub timeout_ns: i64,
    /// `(count, interval_ns)` pairs: insert one frame every `interval_ns`, `count` times.
    pub schedule: Vec<(u32, i64)>,
}

impl PresentTimeoutOverride {
    /// Expands the schedule into relative events, at most `MAX_EVENTS` of them like a
    /// plugin schedule.
    pub fn events(&self) -> Vec<TimedEvent> {
        let mut events = Vec::new();
        let mut when_ns: i64 = 0;
        'schedule: for &(count, interval_ns) in &self.schedule {
            for _ in 0..count {
                if events.len() == MAX_EVENTS {
                    warn!("truncating present timeout schedule to {MAX_EVENTS} events");
                    break 'schedule;
                }
                when_ns = when_ns.saturating_add(interval_ns);
                events.push(TimedEvent {
                    when_ns,
                    is_relative: true,
                    command: PanelCommand::FrameInsertion { frames: 1 },
                });
            }
        }
        events
    }
}

impl From<&hwc_vrr_config::VendorPresentTimeout> for PresentTimeoutOverride {
    fn from(config: &hwc_vrr_config::VendorPresentTimeout) -> Self {
        Self {
            timeout_ns: crate::utils::ms_to_ns(config.timeout_ms),
            schedule: config
                .intervals
                .iter()
                .map(|i| (i.count, crate::utils::ms_to_ns(i.interval_ms)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C" fn plugin_events(
        ctx: *mut c_void,
        events: *mut RawTimedEvent,
        capacity: usize,
    ) -> usize {
        let base = *(ctx as *const i64);
        let out = std::slice::from_raw_parts_mut(events, capacity);
        out[0] = RawTimedEvent {
            when_ns: base,
            is_relative: 1,
            kind: RAW_EVENT_FRAME_INSERTION,
            value: 2,
        };
        out[1] = RawTimedEvent {
            when_ns: 5,
            is_relative: 0,
            kind: 99,
            value: 0,
        };
        out[2] = RawTimedEvent {
            when_ns: 1_000,
            is_relative: 0,
            kind: RAW_EVENT_TE2_RATE,
            value: 30,
        };
        3
    }

    #[test]
    fn copies_raw_events() {
        let mut base: i64 = 16_000_000;
        let mut raw = RawExternalEventHandler {
            ctx: &mut base as *mut i64 as *mut c_void,
            get_handle_events: Some(plugin_events),
        };

        let events = unsafe { collect_events(&mut raw) };
        assert_eq!(
            events,
            [
                TimedEvent {
                    when_ns: 16_000_000,
                    is_relative: true,
                    command: PanelCommand::FrameInsertion { frames: 2 },
                },
                TimedEvent {
                    when_ns: 1_000,
                    is_relative: false,
                    command: PanelCommand::Te2Rate { hz: 30 },
                },
            ]
        );
        assert_eq!(events[0].deadline(100), 16_000_100);
        assert_eq!(events[1].deadline(100), 1_000);
    }

    #[test]
    fn missing_callback_yields_nothing() {
        let mut raw = RawExternalEventHandler {
            ctx: ptr::null_mut(),
            get_handle_events: None,
        };
        assert!(unsafe { collect_events(&mut raw) }.is_empty());
    }

    #[test]
    fn load_failure_is_an_error() {
        let err = ExternalEventHandlerLoader::load(Path::new("/nonexistent/libpanel.so"), "panel")
            .err()
            .unwrap();
        assert!(format!("{err:#}").contains("libpanel.so"));
    }

    #[test]
    fn override_expands_schedule() {
        let timeout = PresentTimeoutOverride {
            timeout_ns: 50,
            schedule: vec![(2, 10), (1, 30)],
        };
        let deadlines: Vec<_> = timeout.events().iter().map(|e| e.deadline(1000)).collect();
        assert_eq!(deadlines, [1010, 1020, 1050]);
    }

    #[test]
    fn override_schedule_is_capped() {
        let timeout = PresentTimeoutOverride {
            timeout_ns: 0,
            schedule: vec![(u32::MAX, 1), (u32::MAX, i64::MAX)],
        };
        let events = timeout.events();
        assert_eq!(events.len(), MAX_EVENTS);
        assert_eq!(events.last().unwrap().when_ns, MAX_EVENTS as i64);
    }
}
