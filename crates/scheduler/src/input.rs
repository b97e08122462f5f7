//! Input event classification and the input stream state machine.
//!
//! Input events arrive on the compositor thread and drive policy
//! escalation. Only events that signal an interactive burst count: mouse
//! moves without the left button held, other plain mouse events (the wheel
//! excepted) and keyboard events are ignored entirely.

/// The subset of platform input events the scheduler cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    TouchStart,
    TouchMove,
    TouchEnd,
    TouchCancel,
    MouseMove { left_button_down: bool },
    MouseDown,
    MouseUp,
    MouseWheel,
    KeyDown,
    KeyUp,
    GestureScrollBegin,
    GestureScrollUpdate,
    GestureScrollEnd,
    GestureFlingStart,
    GestureFlingCancel,
    GestureTapDown,
    GestureShowPress,
    GestureTap,
    /// Synthetic marker used when the compositor animated for input
    /// without a concrete event.
    Undefined,
}

impl InputEvent {
    /// Whether this event signals user interaction needing a smooth frame
    /// rate. A mouse move only counts while the left button is down; the
    /// wheel always counts; keyboard input never does.
    #[must_use]
    pub fn is_scheduling_signal(self) -> bool {
        match self {
            Self::MouseMove { left_button_down } => left_button_down,
            Self::MouseDown | Self::MouseUp | Self::KeyDown | Self::KeyUp => false,
            _ => true,
        }
    }
}

/// Where the scheduler believes the input stream currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputStreamState {
    Inactive,
    Active,
    /// A touch start was seen and the page has not yet demonstrably
    /// responded; loading work is deferred entirely while here.
    ActiveAwaitingTouchstartResponse,
}

/// Next input stream state given the current state, the new event and the
/// event before it.
///
/// Consecutive touch moves are a strong signal the page is consuming the
/// gesture, so the second one demotes the touchstart-response state to
/// plain active. Meta events with no observable effect preserve the
/// current state.
#[must_use]
pub fn compute_new_input_stream_state(
    current: InputStreamState,
    new_event: InputEvent,
    last_event: InputEvent,
) -> InputStreamState {
    match new_event {
        InputEvent::TouchStart => InputStreamState::ActiveAwaitingTouchstartResponse,
        InputEvent::TouchMove => {
            if current == InputStreamState::ActiveAwaitingTouchstartResponse {
                if last_event == InputEvent::TouchMove {
                    InputStreamState::Active
                } else {
                    InputStreamState::ActiveAwaitingTouchstartResponse
                }
            } else {
                InputStreamState::Active
            }
        }
        InputEvent::GestureTapDown
        | InputEvent::GestureShowPress
        | InputEvent::GestureFlingCancel
        | InputEvent::GestureScrollEnd => current,
        _ => InputStreamState::Active,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touch_start_awaits_a_response() {
        let state = compute_new_input_stream_state(
            InputStreamState::Inactive,
            InputEvent::TouchStart,
            InputEvent::Undefined,
        );
        assert_eq!(state, InputStreamState::ActiveAwaitingTouchstartResponse);
    }

    #[test]
    fn first_touch_move_preserves_the_awaiting_state() {
        let state = compute_new_input_stream_state(
            InputStreamState::ActiveAwaitingTouchstartResponse,
            InputEvent::TouchMove,
            InputEvent::TouchStart,
        );
        assert_eq!(state, InputStreamState::ActiveAwaitingTouchstartResponse);
    }

    #[test]
    fn second_consecutive_touch_move_demotes_to_active() {
        let state = compute_new_input_stream_state(
            InputStreamState::ActiveAwaitingTouchstartResponse,
            InputEvent::TouchMove,
            InputEvent::TouchMove,
        );
        assert_eq!(state, InputStreamState::Active);
    }

    #[test]
    fn meta_events_preserve_the_current_state() {
        for event in [
            InputEvent::GestureTapDown,
            InputEvent::GestureShowPress,
            InputEvent::GestureFlingCancel,
            InputEvent::GestureScrollEnd,
        ] {
            let state = compute_new_input_stream_state(
                InputStreamState::ActiveAwaitingTouchstartResponse,
                event,
                InputEvent::TouchStart,
            );
            assert_eq!(state, InputStreamState::ActiveAwaitingTouchstartResponse);
        }
    }

    #[test]
    fn scroll_updates_are_plain_activity() {
        let state = compute_new_input_stream_state(
            InputStreamState::Inactive,
            InputEvent::GestureScrollUpdate,
            InputEvent::Undefined,
        );
        assert_eq!(state, InputStreamState::Active);
    }

    #[test]
    fn mouse_and_keyboard_filtering() {
        assert!(!InputEvent::MouseMove {
            left_button_down: false
        }
        .is_scheduling_signal());
        assert!(InputEvent::MouseMove {
            left_button_down: true
        }
        .is_scheduling_signal());
        assert!(InputEvent::MouseWheel.is_scheduling_signal());
        assert!(!InputEvent::KeyDown.is_scheduling_signal());
        assert!(!InputEvent::MouseDown.is_scheduling_signal());
    }
}
