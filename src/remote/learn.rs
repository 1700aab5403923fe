//! Learning IR codes from a physical remote
//!
//! The device is sent the learn trigger and then stays silent until a
//! button is pressed in front of it. It answers with the captured code
//! and closes the connection.

use tracing::{error, info, warn};

use super::{Remote, StoredCode};
use crate::error::{DeviceError, Result};
use crate::protocol::{learned_code, LEARN_REQUEST};
use crate::transport::{ReadUntil, Session};

pub const LEARN_NOTIFICATION_ID: &str = "wfirex4_learn_command";

impl Remote {
    /// Capture one code; the user is asked to press `command`'s button
    pub async fn learn_command(&mut self, command: &str) -> Result<String> {
        let mut session = Session::open(
            &self.settings.host,
            self.settings.port,
            self.settings.timeouts.connect,
        )
        .await?;
        let captured = self.capture(&mut session, command).await;
        session.close().await;

        let code = learned_code(&captured?)?;
        info!("Learned '{}': {}", command, code);
        self.attributes.last_learn = Some(code.clone());
        Ok(code)
    }

    async fn capture(&self, session: &mut Session, command: &str) -> Result<Vec<u8>> {
        session.send(&LEARN_REQUEST).await?;
        info!("Waiting for '{}' on {}", command, session.addr());

        self.notifier.notify(
            LEARN_NOTIFICATION_ID,
            "Learn command",
            &format!("Press the '{}' button.", command),
        );
        let data = session
            .drain(ReadUntil::Closed, self.settings.learn_timeout)
            .await;
        self.notifier.dismiss(LEARN_NOTIFICATION_ID);

        data
    }

    async fn learn_stored(&mut self, command: &str, toggle: bool) -> Result<StoredCode> {
        let first = self.learn_command(command).await?;
        if !toggle {
            return Ok(StoredCode::Single(first));
        }
        let second = self.learn_command(command).await?;
        Ok(StoredCode::Toggle([first, second]))
    }

    /// Learn each of `commands` for `device`
    ///
    /// With `toggle`, every command is learned twice and stored as an
    /// alternating pair. A failed command is logged and skipped. The
    /// library is saved once at the end if anything was learned.
    pub async fn learn_commands(
        &mut self,
        commands: &[String],
        device: &str,
        toggle: bool,
    ) -> Result<usize> {
        if !self.is_on {
            warn!(
                "learn_command canceled: {} is turned off",
                self.settings.name
            );
            return Err(DeviceError::Disabled);
        }

        let mut learned = 0;
        for command in commands {
            match self.learn_stored(command, toggle).await {
                Ok(code) => {
                    self.codes
                        .entry(device.to_string())
                        .or_default()
                        .insert(command.clone(), code);
                    learned += 1;
                }
                Err(e) => {
                    error!("Failed to learn '{}': {}", command, e);
                }
            }
        }

        if learned > 0 {
            let data = serde_json::to_value(&self.codes)?;
            self.code_store.save(&data).await?;
        }
        Ok(learned)
    }
}
