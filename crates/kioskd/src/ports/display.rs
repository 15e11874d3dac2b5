//! X display introspection via xrandr and xdotool

use super::command::run_command;
use super::DisplayIntrospection;
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub struct XDisplay {
    display: String,
    timeout: Duration,
}

impl XDisplay {
    pub fn new(display: impl Into<String>, timeout: Duration) -> Self {
        Self {
            display: display.into(),
            timeout,
        }
    }
}

#[async_trait]
impl DisplayIntrospection for XDisplay {
    async fn is_display_connected(&self) -> bool {
        let env = [("DISPLAY", self.display.as_str())];
        match run_command("xrandr", &["--query"], &env, self.timeout).await {
            Ok(output) if output.success => has_connected_output(&output.stdout),
            Ok(output) => {
                debug!("xrandr failed: {}", output.stderr.trim());
                false
            }
            Err(e) => {
                debug!("xrandr failed: {}", e);
                false
            }
        }
    }

    async fn is_window_visible(&self, title: &str) -> bool {
        let env = [("DISPLAY", self.display.as_str())];
        match run_command(
            "xdotool",
            &["search", "--onlyvisible", "--name", title],
            &env,
            self.timeout,
        )
        .await
        {
            // xdotool exits 1 with no output when nothing matches
            Ok(output) => output.success && !output.stdout.trim().is_empty(),
            Err(e) => {
                debug!("xdotool failed: {}", e);
                false
            }
        }
    }
}

/// True when any xrandr output line reports `connected` (not `disconnected`)
pub fn has_connected_output(xrandr: &str) -> bool {
    xrandr
        .lines()
        .filter(|line| !line.starts_with(char::is_whitespace))
        .any(|line| line.split_whitespace().nth(1) == Some("connected"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONNECTED: &str = "\
Screen 0: minimum 320 x 200, current 1920 x 1080, maximum 16384 x 16384
HDMI-1 connected primary 1920x1080+0+0 (normal left inverted right x axis y axis) 527mm x 296mm
   1920x1080     60.00*+  50.00
DP-1 disconnected (normal left inverted right x axis y axis)
";

    const DISCONNECTED: &str = "\
Screen 0: minimum 320 x 200, current 1024 x 768, maximum 16384 x 16384
HDMI-1 disconnected (normal left inverted right x axis y axis)
DP-1 disconnected (normal left inverted right x axis y axis)
";

    #[test]
    fn test_connected_output_detected() {
        assert!(has_connected_output(CONNECTED));
    }

    #[test]
    fn test_disconnected_is_not_connected() {
        assert!(!has_connected_output(DISCONNECTED));
        assert!(!has_connected_output(""));
    }
}
