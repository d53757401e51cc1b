//! Application-wide constants for extruder-rs.
//!
//! Centralizes the file names, defaults and tuning values shared by the
//! configuration store, the slicer wrapper and the slice queue.

use std::time::Duration;

// ============================================================================
// Application Identity
// ============================================================================

/// Directory name used under the platform configuration directory.
pub const APP_DIR_NAME: &str = "extruder-rs";

// ============================================================================
// Configuration File
// ============================================================================

/// File name of the persisted extruder settings.
pub const CONFIG_FILE_NAME: &str = "motoman_hd10_config.cfg";

/// The single section holding every extruder setting.
pub const EXTRUDER_SECTION: &str = "ExtruderSettings";

/// Value returned for a missing or unparsable setting under the lenient policy.
pub const DEFAULT_SETTING_VALUE: i64 = 50;

// ============================================================================
// External Slicer
// ============================================================================

/// Slicer executable looked up on `PATH` unless overridden.
pub const DEFAULT_SLICER_PROGRAM: &str = "mandoline";

/// Flag preceding the output path when slicing.
pub const SLICER_OUTPUT_FLAG: &str = "-o";

/// Argument used when probing whether the slicer can be started.
pub const SLICER_PROBE_ARG: &str = "--help";

/// Extension given to generated machine-code files.
pub const GCODE_EXTENSION: &str = "gcode";

/// Polling interval while waiting on a slicer with a timeout.
pub const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Slice Queue
// ============================================================================

/// Buffer size for the slice queue channel.
/// Size of 1 means at most one job waits while another runs;
/// further submissions are rejected instead of piling up.
pub const SLICE_QUEUE_BUFFER: usize = 1;
