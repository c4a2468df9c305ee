//! FFI bindings for the ski telemetry engine
//!
//! This module provides C-compatible functions for calling the engine from
//! mobile hosts. Strings are null-terminated UTF-8; every string returned must
//! be freed by the caller using `ski_free_string`.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::mem;
use std::os::raw::c_char;
use std::ptr;
use std::slice;

use crate::config::EngineConfig;
use crate::encoder::ReportEncoder;
use crate::error::EngineError;
use crate::pipeline::{import_report_json, TrackProcessor};
use crate::schema::LocationFix;
use crate::types::SourceFormat;

// Thread-local storage for the last error message
thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

fn clear_last_error() {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = None;
    });
}

/// Helper to convert C string to Rust string
unsafe fn cstr_to_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok().map(|s| s.to_string())
}

/// Helper to convert Rust string to C string (caller must free)
fn string_to_cstr(s: &str) -> *mut c_char {
    match CString::new(s) {
        Ok(cstr) => cstr.into_raw(),
        Err(_) => ptr::null_mut(),
    }
}

/// Hand a result string to C, or record the error and return NULL
fn into_c_result(result: Result<String, EngineError>) -> *mut c_char {
    match result {
        Ok(json) => string_to_cstr(&json),
        Err(e) => {
            set_last_error(&e.to_string());
            ptr::null_mut()
        }
    }
}

unsafe fn import(
    data: *const u8,
    len: usize,
    name: *const c_char,
    format: SourceFormat,
) -> *mut c_char {
    clear_last_error();

    if data.is_null() {
        set_last_error("Null data pointer");
        return ptr::null_mut();
    }
    let bytes = slice::from_raw_parts(data, len);
    let name = cstr_to_string(name);

    into_c_result(import_report_json(
        bytes,
        format,
        name.as_deref(),
        &EngineConfig::default(),
    ))
}

// ============================================================================
// Batch Import API
// ============================================================================

/// Import a GPX file and return the track report as JSON.
///
/// # Safety
/// - `data` must point to `len` readable bytes.
/// - `name` may be NULL (use the name in the file) or a valid C string.
/// - Returns a newly allocated string that must be freed with `ski_free_string`.
/// - Returns NULL on error; call `ski_last_error` to get the error message.
#[no_mangle]
pub unsafe extern "C" fn ski_import_gpx(
    data: *const u8,
    len: usize,
    name: *const c_char,
) -> *mut c_char {
    import(data, len, name, SourceFormat::Gpx)
}

/// Import a FIT activity and return the track report as JSON.
///
/// # Safety
/// Same contract as `ski_import_gpx`.
#[no_mangle]
pub unsafe extern "C" fn ski_import_fit(
    data: *const u8,
    len: usize,
    name: *const c_char,
) -> *mut c_char {
    import(data, len, name, SourceFormat::Fit)
}

// ============================================================================
// Live Processor API
// ============================================================================

/// Opaque handle to a live TrackProcessor
pub struct SkiProcessorHandle {
    processor: TrackProcessor,
    encoder: ReportEncoder,
}

/// Create a live processor.
///
/// # Safety
/// - `config_json` may be NULL for defaults, or a C string holding an
///   `EngineConfig` JSON object (missing fields take their defaults).
/// - Must be freed with `ski_processor_free`.
/// - Returns NULL on error.
#[no_mangle]
pub unsafe extern "C" fn ski_processor_new(config_json: *const c_char) -> *mut SkiProcessorHandle {
    clear_last_error();

    let config = if config_json.is_null() {
        EngineConfig::default()
    } else {
        let json = match cstr_to_string(config_json) {
            Some(s) => s,
            None => {
                set_last_error("Invalid config string pointer");
                return ptr::null_mut();
            }
        };
        match EngineConfig::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                set_last_error(&EngineError::from(e).to_string());
                return ptr::null_mut();
            }
        }
    };

    let handle = Box::new(SkiProcessorHandle {
        processor: TrackProcessor::with_config(config),
        encoder: ReportEncoder::new(),
    });
    Box::into_raw(handle)
}

/// Free a live processor.
///
/// # Safety
/// - `processor` must be a valid pointer returned by `ski_processor_new`, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn ski_processor_free(processor: *mut SkiProcessorHandle) {
    if !processor.is_null() {
        drop(Box::from_raw(processor));
    }
}

/// Push one location fix and return the live snapshot as JSON.
///
/// # Safety
/// - `processor` must be a valid pointer returned by `ski_processor_new`.
/// - `fix_json` must be a valid C string holding a location fix object.
/// - Returns a newly allocated string that must be freed with `ski_free_string`.
/// - Returns NULL on error (the fix is dropped and the processor unchanged).
#[no_mangle]
pub unsafe extern "C" fn ski_processor_push_sample(
    processor: *mut SkiProcessorHandle,
    fix_json: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if processor.is_null() {
        set_last_error("Null processor pointer");
        return ptr::null_mut();
    }
    let handle = &mut *processor;

    let json = match cstr_to_string(fix_json) {
        Some(s) => s,
        None => {
            set_last_error("Invalid sample string pointer");
            return ptr::null_mut();
        }
    };

    let result = serde_json::from_str::<LocationFix>(&json)
        .map_err(EngineError::from)
        .and_then(|fix| {
            fix.validate()?;
            handle.processor.push(&fix.to_raw_sample())?;
            handle.encoder.encode_live_to_json(&handle.processor)
        });
    into_c_result(result)
}

/// Current live snapshot as JSON.
///
/// # Safety
/// - `processor` must be a valid pointer returned by `ski_processor_new`.
/// - Returns a newly allocated string that must be freed with `ski_free_string`.
#[no_mangle]
pub unsafe extern "C" fn ski_processor_snapshot(processor: *mut SkiProcessorHandle) -> *mut c_char {
    clear_last_error();

    if processor.is_null() {
        set_last_error("Null processor pointer");
        return ptr::null_mut();
    }
    let handle = &*processor;
    into_c_result(handle.encoder.encode_live_to_json(&handle.processor))
}

/// Finish the recording and return the full track report as JSON.
///
/// The processor is reset and can record a new track afterwards.
///
/// # Safety
/// - `processor` must be a valid pointer returned by `ski_processor_new`.
/// - `name` may be NULL or a valid C string.
/// - Returns a newly allocated string that must be freed with `ski_free_string`.
#[no_mangle]
pub unsafe extern "C" fn ski_processor_finish(
    processor: *mut SkiProcessorHandle,
    name: *const c_char,
) -> *mut c_char {
    clear_last_error();

    if processor.is_null() {
        set_last_error("Null processor pointer");
        return ptr::null_mut();
    }
    let handle = &mut *processor;

    let config = handle.processor.config().clone();
    let finished = mem::replace(&mut handle.processor, TrackProcessor::with_config(config.clone()));
    let name = cstr_to_string(name).unwrap_or_else(|| crate::pipeline::DEFAULT_TRACK_NAME.to_string());
    let track = finished.finish(name, SourceFormat::Live);

    into_c_result(handle.encoder.encode_track_to_json(&track, &config.analytics))
}

// ============================================================================
// Memory Management
// ============================================================================

/// Free a string returned by an engine function.
///
/// # Safety
/// - `ptr` must be a valid pointer returned by an engine function, or NULL.
/// - After calling this function, the pointer is invalid.
#[no_mangle]
pub unsafe extern "C" fn ski_free_string(ptr: *mut c_char) {
    if !ptr.is_null() {
        drop(CString::from_raw(ptr));
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Get the last error message.
///
/// # Safety
/// - Returns a pointer to a thread-local error string.
/// - The returned pointer is valid until the next engine call on this thread.
/// - Do NOT free the returned pointer.
/// - Returns NULL if no error occurred.
#[no_mangle]
pub unsafe extern "C" fn ski_last_error() -> *const c_char {
    LAST_ERROR.with(|e| match &*e.borrow() {
        Some(cstr) => cstr.as_ptr(),
        None => ptr::null(),
    })
}

/// Get the engine version.
///
/// # Safety
/// - Returns a pointer to a static string. Do NOT free.
#[no_mangle]
pub unsafe extern "C" fn ski_version() -> *const c_char {
    static VERSION: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn sample_gpx() -> String {
        let t0 = Utc.with_ymd_and_hms(2024, 2, 10, 9, 0, 0).unwrap();
        let points: String = (0..60)
            .map(|i| {
                format!(
                    r#"<trkpt lat="{}" lon="7.0"><ele>{}</ele><time>{}</time></trkpt>"#,
                    46.0 + i as f64 * 8.0 / 111_195.0,
                    2500.0 - i as f64 * 2.0,
                    (t0 + Duration::seconds(i)).to_rfc3339()
                )
            })
            .collect();
        format!(r#"<gpx version="1.1"><trk><name>Piste</name><trkseg>{points}</trkseg></trk></gpx>"#)
    }

    fn fix_json(i: i64) -> CString {
        let t0 = Utc.with_ymd_and_hms(2024, 2, 10, 9, 0, 0).unwrap();
        let mut fix = LocationFix::new(
            t0 + Duration::seconds(i),
            46.0 + i as f64 * 8.0 / 111_195.0,
            7.0,
        );
        fix.elevation = Some(2500.0 - i as f64 * 2.0);
        CString::new(serde_json::to_string(&fix).unwrap()).unwrap()
    }

    #[test]
    fn test_ffi_import_gpx() {
        let gpx = sample_gpx();
        unsafe {
            let result = ski_import_gpx(gpx.as_ptr(), gpx.len(), ptr::null());
            assert!(!result.is_null());

            let report = CStr::from_ptr(result).to_str().unwrap();
            assert!(report.contains("\"run_count\": 1"));
            assert!(report.contains("Piste"));

            ski_free_string(result);
        }
    }

    #[test]
    fn test_ffi_processor_lifecycle() {
        unsafe {
            let processor = ski_processor_new(ptr::null());
            assert!(!processor.is_null());

            for i in 0..60 {
                let json = fix_json(i);
                let snapshot = ski_processor_push_sample(processor, json.as_ptr());
                assert!(!snapshot.is_null());
                ski_free_string(snapshot);
            }

            let snapshot = ski_processor_snapshot(processor);
            let text = CStr::from_ptr(snapshot).to_str().unwrap();
            assert!(text.contains("\"point_count\":60"));
            ski_free_string(snapshot);

            let name = CString::new("Morning").unwrap();
            let report = ski_processor_finish(processor, name.as_ptr());
            assert!(!report.is_null());
            let text = CStr::from_ptr(report).to_str().unwrap();
            assert!(text.contains("Morning"));
            assert!(text.contains("\"source\": \"live\""));
            ski_free_string(report);

            ski_processor_free(processor);
        }
    }

    #[test]
    fn test_ffi_error_handling() {
        unsafe {
            let garbage = b"not a track";
            let result = ski_import_gpx(garbage.as_ptr(), garbage.len(), ptr::null());
            assert!(result.is_null());

            let error = ski_last_error();
            assert!(!error.is_null());
            let error_str = CStr::from_ptr(error).to_str().unwrap();
            assert!(error_str.contains("Malformed"));

            let processor = ski_processor_new(ptr::null());
            let bad = CString::new(
                r#"{"timestamp":"2024-02-10T09:00:00Z","latitude":95.0,"longitude":7.0}"#,
            )
            .unwrap();
            assert!(ski_processor_push_sample(processor, bad.as_ptr()).is_null());
            assert!(!ski_last_error().is_null());
            ski_processor_free(processor);
        }
    }

    #[test]
    fn test_ffi_invalid_config() {
        unsafe {
            let config = CString::new("{ nope").unwrap();
            assert!(ski_processor_new(config.as_ptr()).is_null());
            assert!(!ski_last_error().is_null());
        }
    }

    #[test]
    fn test_ffi_version() {
        unsafe {
            let version = ski_version();
            assert!(!version.is_null());

            let version_str = CStr::from_ptr(version).to_str().unwrap();
            assert!(!version_str.is_empty());
        }
    }
}
