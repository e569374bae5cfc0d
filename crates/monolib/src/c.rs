//! C ABI (`include/monolib.h`).
//!
//! Every export maps onto one [`Player`] operation on a lazily created process-wide
//! player. Getters never fail and never block on the stream: absent values come back as
//! `""`, `0.0`, a null length pointer or an empty image. Strings and images are owned by
//! the caller and must be released with `c_drop_string` / `c_drop`.

use std::cell::Cell;
use std::ffi::{CStr, c_char, c_float};
use std::ptr;
use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::buffer;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::player::Player;
use crate::reader::format_playlist_listing;
use crate::settings::Settings;

/// Encoder and cover selection as passed by hosts.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CSettings {
    /// Encoder code (`0` PCM16 ... `8` SEA).
    pub encoder: u8,
    /// Cover size in pixels; `0` original size, negative for no cover.
    pub cover: i32,
}

/// Cover art handed to the host. Release `bytes` with `c_drop(bytes, length)`.
#[repr(C)]
#[derive(Debug)]
pub struct CImageJpeg {
    pub length: u32,
    pub bytes: *mut u8,
}

static PLAYER: OnceLock<Player> = OnceLock::new();

fn player() -> &'static Player {
    PLAYER.get_or_init(|| {
        init_logging();
        let config = EngineConfig::from_env();
        tracing::debug!(?config, "creating player");
        Player::with_cpal(config)
    })
}

/// Install a `RUST_LOG`-driven subscriber unless the host already installed one.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,monolib=info")),
        )
        .try_init();
}

/// Borrow a C string argument. `None` for null; invalid UTF-8 is an error.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string valid for `'a`.
unsafe fn str_arg<'a>(ptr: *const c_char, what: &str) -> EngineResult<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .map(Some)
        .map_err(|_| EngineError::InvalidSettings(format!("{what} is not valid UTF-8")))
}

fn status(result: EngineResult<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    }
}

/// Validate the raw arguments, then start. Nothing is torn down when validation fails.
fn start_on(
    player: &Player,
    server: EngineResult<Option<&str>>,
    settings: impl FnOnce() -> EngineResult<Settings>,
) -> i32 {
    let validated = server.and_then(|server| {
        let server = server
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| EngineError::InvalidSettings("server address is empty".to_string()))?;
        Ok((server, settings()?))
    });
    let result = match validated {
        Ok((server, settings)) => player.start(server, settings),
        Err(e) => {
            tracing::warn!(error = %e, "rejected start request");
            player.set_last_error(e.clone());
            Err(e)
        }
    };
    status(result)
}

fn owned_string(value: Option<&str>) -> *mut c_char {
    buffer::acquire_c_string(value.unwrap_or(""))
}

fn artist_of(player: &Player) -> *mut c_char {
    owned_string(player.metadata().as_ref().and_then(|m| m.artist.as_deref()))
}

fn album_of(player: &Player) -> *mut c_char {
    owned_string(player.metadata().as_ref().and_then(|m| m.album.as_deref()))
}

fn title_of(player: &Player) -> *mut c_char {
    owned_string(player.metadata().as_ref().and_then(|m| m.title.as_deref()))
}

fn length_of(player: &Player) -> Option<f32> {
    player.metadata().and_then(|m| m.length_seconds)
}

fn length_ptr_of(player: &Player) -> *const c_float {
    match length_of(player) {
        Some(len) => LENGTH_SLOT.with(|slot| {
            slot.set(len);
            slot.as_ptr() as *const c_float
        }),
        None => ptr::null(),
    }
}

fn cover_of(player: &Player) -> CImageJpeg {
    let Some(cover) = player.metadata().and_then(|m| m.cover.clone()) else {
        return CImageJpeg::empty();
    };
    let Ok(length) = u32::try_from(cover.len()) else {
        tracing::warn!(len = cover.len(), "cover too large for the C ABI");
        return CImageJpeg::empty();
    };
    let (bytes, _len) = buffer::acquire(cover.to_vec()).into_raw_parts();
    CImageJpeg { length, bytes }
}

impl CImageJpeg {
    fn empty() -> Self {
        Self {
            length: 0,
            bytes: ptr::null_mut(),
        }
    }
}

thread_local! {
    static LENGTH_SLOT: Cell<c_float> = const { Cell::new(0.0) };
}

/// Start playing `server` (`host:port`) with `settings`, restricted to `playlist` when it
/// is non-null and non-empty. Returns `0` or an error code.
///
/// # Safety
/// `server` and `playlist` must be null or valid NUL-terminated strings.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn c_start(server: *const c_char, settings: CSettings, playlist: *const c_char) -> i32 {
    let server = unsafe { str_arg(server, "server address") };
    let playlist = unsafe { str_arg(playlist, "playlist") };
    start_on(player(), server, || {
        Settings::from_codes(settings.encoder, settings.cover, playlist?)
    })
}

/// Start playing all tracks of `server` with `settings`.
///
/// # Safety
/// `server` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn c_start_settings(server: *const c_char, settings: CSettings) -> i32 {
    let server = unsafe { str_arg(server, "server address") };
    start_on(player(), server, || Settings::from_codes(settings.encoder, settings.cover, None))
}

/// Start playing all tracks of `server` as PCM16 without covers.
///
/// # Safety
/// `server` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn c_start_server(server: *const c_char) -> i32 {
    let server = unsafe { str_arg(server, "server address") };
    start_on(player(), server, || Ok(Settings::default()))
}

/// Newline-separated playlist names of `server`; `""` on failure (see `c_last_error`).
///
/// # Safety
/// `server` must be null or a valid NUL-terminated string.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn c_list_playlists(server: *const c_char) -> *mut c_char {
    let player = player();
    let result = unsafe { str_arg(server, "server address") }.and_then(|server| {
        let server = server.ok_or_else(|| EngineError::InvalidSettings("server address is empty".to_string()))?;
        player.list_playlists(server)
    });
    match result {
        Ok(names) => buffer::acquire_c_string(&format_playlist_listing(&names)),
        Err(e) => {
            tracing::warn!(error = %e, "listing playlists failed");
            player.set_last_error(e);
            buffer::acquire_c_string("")
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn c_toggle() {
    player().toggle();
}

#[unsafe(no_mangle)]
pub extern "C" fn c_stop() {
    player().stop();
}

#[unsafe(no_mangle)]
pub extern "C" fn c_reset() {
    player().reset();
}

/// `0` stopped, `1` connecting, `2` playing, `3` paused, `4` error.
#[unsafe(no_mangle)]
pub extern "C" fn c_get_state() -> c_char {
    player().state().code() as c_char
}

/// `1` while audio is playing, otherwise `0`.
#[unsafe(no_mangle)]
pub extern "C" fn c_is_playing() -> u8 {
    player().state().is_playing() as u8
}

/// Artist of the current track, `""` when unknown.
///
/// Each metadata getter reads its own snapshot. Two calls can straddle a track change,
/// so artist and title fetched back to back may belong to different tracks.
#[unsafe(no_mangle)]
pub extern "C" fn c_get_metadata_artist() -> *mut c_char {
    artist_of(player())
}

/// Album of the current track; same per-call snapshot as `c_get_metadata_artist`.
#[unsafe(no_mangle)]
pub extern "C" fn c_get_metadata_album() -> *mut c_char {
    album_of(player())
}

/// Title of the current track; same per-call snapshot as `c_get_metadata_artist`.
#[unsafe(no_mangle)]
pub extern "C" fn c_get_metadata_title() -> *mut c_char {
    title_of(player())
}

/// Track length in seconds, `0.0` when unknown.
#[unsafe(no_mangle)]
pub extern "C" fn c_get_metadata_length() -> c_float {
    length_of(player()).unwrap_or(0.0)
}

/// Track length, or null when unknown.
///
/// The pointee is thread-local and stays valid until the next call on the same thread.
/// It is not owned by the caller and must not be passed to `c_drop`.
#[unsafe(no_mangle)]
pub extern "C" fn c_get_metadata_length_ptr() -> *const c_float {
    length_ptr_of(player())
}

/// Cover art of the current track; `length == 0` and null `bytes` when there is none.
#[unsafe(no_mangle)]
pub extern "C" fn c_get_cover_jpeg() -> CImageJpeg {
    cover_of(player())
}

#[unsafe(no_mangle)]
pub extern "C" fn c_set_volume(volume: u8) {
    player().set_volume(volume);
}

#[unsafe(no_mangle)]
pub extern "C" fn c_get_volume() -> u8 {
    player().volume()
}

/// Message of the most recent error, `""` if none.
#[unsafe(no_mangle)]
pub extern "C" fn c_last_error() -> *mut c_char {
    let msg = player().last_error().map(|e| e.to_string());
    owned_string(msg.as_deref())
}

/// Release a buffer returned by this library.
///
/// # Safety
/// `ptr`/`count` must describe one buffer returned by this library (for images,
/// `bytes`/`length`) that has not been released yet. Null is a no-op.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn c_drop(ptr: *mut u8, count: usize) {
    unsafe { buffer::release(ptr, count) }
}

/// Release a string returned by this library. Null is a no-op.
///
/// # Safety
/// `ptr` must be a string returned by this library that has not been released yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn c_drop_string(ptr: *mut c_char) {
    unsafe { buffer::release_c_string(ptr) }
}

/// Unprefixed entry points of the first header revision.
#[cfg(feature = "legacy-abi")]
pub mod legacy {
    use super::*;

    /// # Safety
    /// `server` must be null or a valid NUL-terminated string.
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn start(server: *const c_char) {
        unsafe { c_start_server(server) };
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn toggle() {
        c_toggle();
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn reset() {
        c_reset();
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn get_metadata_artist() -> *mut c_char {
        c_get_metadata_artist()
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn get_metadata_album() -> *mut c_char {
        c_get_metadata_album()
    }

    #[unsafe(no_mangle)]
    pub extern "C" fn get_metadata_title() -> *mut c_char {
        c_get_metadata_title()
    }
}
