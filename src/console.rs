//! Serial console attachment.
//!
//! Forks `virsh console` with the controlling terminal attached. SIGINT is
//! forwarded to the child (so Ctrl+C reaches the guest), SIGTERM terminates
//! it, and the child's exit status becomes ours.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::error::BoxvmError;

pub async fn run_console(libvirt_uri: &str, vm_name: &str) -> Result<i32, BoxvmError> {
    use tokio::signal::unix::{SignalKind, signal};

    tracing::info!("attaching to VM console (Ctrl+] to exit)");
    let mut child = tokio::process::Command::new("virsh")
        .args(["-c", libvirt_uri, "console", vm_name])
        .spawn()
        .map_err(|e| BoxvmError::io("spawning virsh console", e))?;

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| BoxvmError::io("installing SIGTERM handler", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| BoxvmError::io("installing SIGINT handler", e))?;

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| BoxvmError::io("waiting for virsh console", e))?;
                return Ok(status.code().unwrap_or(1));
            }
            _ = sigint.recv() => {
                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGINT);
                }
            }
            _ = sigterm.recv() => {
                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
            }
        }
    }
}
