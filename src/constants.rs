//! Exit codes, signal sets and defaults shared by the renderer, the supervisor
//! and the entry point.

use std::time::Duration;

use nix::sys::signal::Signal;

// ============================================================================
// Exit Codes
// ============================================================================

/// Exit code when the daemon was terminated by a signal.
pub const EXIT_SIGNALED: i32 = 128;

/// Exit code when the daemon could not be launched (missing binary, not executable).
pub const EXIT_LAUNCH_FAILED: i32 = 127;

/// Exit code when rendering the configuration failed (sysexits `EX_CONFIG`).
pub const EXIT_RENDER_FAILED: i32 = 78;

/// Exit code for invalid command line or config file (sysexits `EX_USAGE`).
pub const EXIT_USAGE: i32 = 64;

// ============================================================================
// Signals
// ============================================================================

/// Signals the supervisor intercepts and relays to the daemon.
pub const FORWARDED_SIGNALS: &[Signal] = &[
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGWINCH,
];

/// Forwarded signals that ask the daemon to stop and arm the `kill_after` timer.
pub const TERMINATION_SIGNALS: &[Signal] = &[Signal::SIGINT, Signal::SIGTERM, Signal::SIGQUIT];

/// Name of the thread relaying signals to the daemon.
pub const SIGNAL_THREAD_NAME: &str = "bootshim-signals";

/// How long processes left in the daemon's group get after SIGTERM when no
/// `kill_after` is configured.
pub const STRAGGLER_GRACE: Duration = Duration::from_secs(1);

/// Interval between liveness checks of the daemon's process group.
pub const GROUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// Rendering
// ============================================================================

/// Mode applied to a freshly created destination file.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Prefix of the temporary file created next to the destination.
pub const TEMP_FILE_PREFIX: &str = ".bootshim-";
