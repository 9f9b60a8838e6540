//! Terminal rendering of pairing artifacts

use std::io::Write;

use botlink_core::{DeviceIdentity, PairingArtifact};
use botlink_runtime::PairingRenderer;
use qrcode::{render::unicode::Dense1x2, QrCode};
use tracing::warn;

/// Prints each pairing code to stdout, optionally as a QR code
#[derive(Debug, Clone)]
pub struct TerminalRenderer {
    qr: bool,
}

impl TerminalRenderer {
    pub fn new(qr: bool) -> Self {
        Self { qr }
    }
}

/// Text block shown to the operator for `artifact`
pub fn render_artifact(artifact: &PairingArtifact, qr: bool) -> String {
    let mut block = String::new();
    if qr {
        match QrCode::new(artifact.code.as_bytes()) {
            Ok(code) => {
                block.push_str(&code.render::<Dense1x2>().quiet_zone(true).build());
                block.push('\n');
            }
            Err(err) => warn!(sequence = artifact.sequence, "Cannot encode pairing QR: {}", err),
        }
    }
    block.push_str(&format!(
        "Pairing code #{}: {}  (valid for {}s)\nConfirm on the primary device, or type /pair {}",
        artifact.sequence,
        artifact.code,
        artifact.valid_for.as_secs(),
        artifact.code
    ));
    block
}

impl PairingRenderer for TerminalRenderer {
    fn render(&self, artifact: &PairingArtifact) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "\n{}\n", render_artifact(artifact, self.qr));
        let _ = out.flush();
    }

    fn paired(&self, identity: &DeviceIdentity) {
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "Paired as {}", identity);
    }
}
