// =============================================================================
// Operator commands — /status, /pause, /resume, /help
// =============================================================================
//
// Transport-agnostic: the Telegram long-poll loop hands raw text (or button
// callback data) to `handle` and sends back whatever it returns.
// =============================================================================

use std::fmt::Write as _;

use crate::guardian::{GuardianController, StatusSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Status,
    Pause,
    Resume,
    Help,
}

impl Command {
    /// Parse `/status`, `status`, `/status@SomeBot` and friends.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let word = word.trim_start_matches('/');
        let word = word.split('@').next().unwrap_or(word);
        match word.to_ascii_lowercase().as_str() {
            "status" => Some(Self::Status),
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "help" | "start" => Some(Self::Help),
            _ => None,
        }
    }
}

pub const HELP_TEXT: &str = "<b>Guardian commands</b>\n\
/status — positions, PnL and stop-loss state\n\
/pause — suspend automatic loss-cap closes\n\
/resume — re-enable automatic closes\n\
/help — this message";

/// Execute `text` against the controller and return the reply, or `None` for
/// text that is not a command.
pub fn handle(controller: &GuardianController, text: &str) -> Option<String> {
    let reply = match Command::parse(text)? {
        Command::Status => render_status(&controller.status()),
        Command::Pause => {
            controller.pause();
            "⏸ Guardian paused. Positions are still watched, but nothing will be closed.".to_string()
        }
        Command::Resume => {
            controller.resume();
            "▶️ Guardian resumed. Loss-cap closes are active.".to_string()
        }
        Command::Help => HELP_TEXT.to_string(),
    };
    Some(reply)
}

pub fn render_status(status: &StatusSnapshot) -> String {
    let mut out = String::new();

    let mode = if status.paused { "⏸ PAUSED" } else { "▶️ ACTIVE" };
    let _ = writeln!(out, "<b>Guardian</b> {mode}{}", if status.dry_run { " (dry run)" } else { "" });
    let _ = writeln!(out, "Max loss: {} USDT", status.max_loss_usdt);

    if status.positions.is_empty() {
        let _ = writeln!(out, "\nNo open positions.");
    } else {
        let _ = writeln!(out);
        for p in &status.positions {
            let breach = if p.loss_cap_breached { " 🔥" } else { "" };
            let _ = writeln!(
                out,
                "{} {} {} {} | PnL {} USDT{breach}",
                p.protection.glyph(),
                p.symbol,
                p.side,
                p.amount,
                p.unrealized_pnl.round_dp(2),
            );
        }
        let _ = writeln!(out, "\n🛡 stop-loss  ⚠️ none  ❔ unknown");
    }

    match status.last_tick_at {
        Some(at) => {
            let _ = writeln!(out, "Last tick: {}", at.format("%H:%M:%S UTC"));
        }
        None => {
            let _ = writeln!(out, "Last tick: none yet");
        }
    }
    if status.consecutive_errors > 0 {
        let _ = writeln!(out, "Consecutive errors: {}", status.consecutive_errors);
    }

    out.trim_end().to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::recording::RecordingSink;
    use crate::exchange::mock::MockExchange;
    use crate::guardian::PositionStatus;
    use crate::runtime_config::RuntimeConfig;
    use crate::stop_loss::ProtectionState;
    use crate::types::PositionSide;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn controller() -> GuardianController {
        GuardianController::new(
            RuntimeConfig::default(),
            Arc::new(MockExchange::new()),
            Arc::new(RecordingSink::default()),
        )
    }

    #[test]
    fn parses_command_variants() {
        assert_eq!(Command::parse("/status"), Some(Command::Status));
        assert_eq!(Command::parse("status"), Some(Command::Status));
        assert_eq!(Command::parse("/pause@guardian_bot"), Some(Command::Pause));
        assert_eq!(Command::parse("  /RESUME now"), Some(Command::Resume));
        assert_eq!(Command::parse("/start"), Some(Command::Help));
        assert_eq!(Command::parse("hello"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn pause_and_resume_flip_the_flag() {
        let c = controller();
        handle(&c, "/pause").unwrap();
        assert!(c.is_paused());
        handle(&c, "/resume").unwrap();
        assert!(!c.is_paused());
        assert!(handle(&c, "what?").is_none());
    }

    #[test]
    fn status_keeps_three_protection_glyphs() {
        let position = |symbol: &str, protection| PositionStatus {
            symbol: symbol.into(),
            side: PositionSide::Long,
            amount: dec!(1),
            unrealized_pnl: dec!(-5),
            protection,
            protection_checked_at: None,
            loss_cap_breached: false,
        };
        let status = StatusSnapshot {
            paused: false,
            dry_run: false,
            max_loss_usdt: dec!(100),
            positions: vec![
                position("AUSDT", ProtectionState::Protected),
                position("BUSDT", ProtectionState::Unprotected),
                position("CUSDT", ProtectionState::Unknown),
            ],
            snapshot_taken_at: None,
            last_tick_at: None,
            consecutive_errors: 2,
            recent_errors: vec![],
        };

        let text = render_status(&status);
        assert!(text.contains("🛡 AUSDT"));
        assert!(text.contains("⚠️ BUSDT"));
        assert!(text.contains("❔ CUSDT"));
        assert!(text.contains("Consecutive errors: 2"));
    }

    #[test]
    fn empty_status_renders() {
        let text = render_status(&controller().status());
        assert!(text.contains("ACTIVE"));
        assert!(text.contains("No open positions."));
    }
}
