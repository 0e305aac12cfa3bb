//! Console rendering of session events.

use grails_lsp::{ProgressUpdate, ServerMessage, SessionEvent, SessionState};

/// The line to print for an event, if any. Trace lines only go to the log.
pub fn render(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::StateChanged(state) => Some(format!("state: {state}")),
        SessionEvent::Progress(update) => Some(render_progress(update)),
        SessionEvent::Message(message) => Some(render_message(message)),
        SessionEvent::Trace(_) => None,
        SessionEvent::StartFailed(err) => Some(format!("start failed: {err}")),
    }
}

fn render_progress(update: &ProgressUpdate) -> String {
    let text = update.event.display_text().unwrap_or("");
    match update.event.percentage() {
        Some(percentage) => format!("[{}] {text} ({percentage}%)", update.token),
        None => format!("[{}] {text}", update.token),
    }
}

pub fn render_message(message: &ServerMessage) -> String {
    format!("{}: {}", message.severity.label(), message.text)
}

/// Status header: the state plus whether a server process is attached.
pub fn render_status(state: SessionState) -> String {
    if state.is_active() {
        format!("state: {state} (server attached)")
    } else {
        format!("state: {state} (no server)")
    }
}

#[cfg(test)]
mod tests {
    use grails_lsp::{MessageSeverity, ProgressEvent};

    use super::*;

    #[test]
    fn state_line() {
        assert_eq!(
            render(&SessionEvent::StateChanged(SessionState::Running)).as_deref(),
            Some("state: running")
        );
    }

    #[test]
    fn progress_lines() {
        let begin = SessionEvent::Progress(ProgressUpdate {
            token: "GLS-SERVER-SETUP".to_string(),
            event: ProgressEvent::Begin {
                title: "Starting".to_string(),
                message: None,
                percentage: None,
            },
        });
        assert_eq!(
            render(&begin).as_deref(),
            Some("[GLS-SERVER-SETUP] Starting")
        );

        let end = SessionEvent::Progress(ProgressUpdate {
            token: "GLS-SERVER-SETUP".to_string(),
            event: ProgressEvent::End { message: None },
        });
        assert_eq!(
            render(&end).as_deref(),
            Some("[GLS-SERVER-SETUP] Server ready (100%)")
        );
    }

    #[test]
    fn traces_are_not_printed() {
        assert_eq!(render(&SessionEvent::Trace("gc".to_string())), None);
    }

    #[test]
    fn message_line_has_severity() {
        let line = render_message(&ServerMessage::new(MessageSeverity::Warning, "slow index"));
        assert!(line.ends_with(": slow index"));
        assert!(line.starts_with(MessageSeverity::Warning.label()));
    }

    #[test]
    fn status_shows_whether_a_server_is_attached() {
        assert_eq!(
            render_status(SessionState::Starting),
            "state: starting (server attached)"
        );
        assert_eq!(
            render_status(SessionState::Running),
            "state: running (server attached)"
        );
        assert_eq!(
            render_status(SessionState::Stopped),
            "state: stopped (no server)"
        );
        assert_eq!(
            render_status(SessionState::Restarting),
            "state: restarting (no server)"
        );
    }
}
