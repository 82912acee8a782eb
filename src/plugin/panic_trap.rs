//! Converts panics inside driver calls into error replies.

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::sync::Once;

static INSTALL: Once = Once::new();

thread_local! {
    static LAST_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Chains a hook that records the backtrace of the panicking thread.
///
/// The previous hook still runs, so the panic message also reaches the
/// plugin's standard error and therefore the driver log.
pub(crate) fn install() {
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let trace = Backtrace::force_capture().to_string();
            LAST_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(trace));
            previous(info);
        }));
    });
}

fn payload_text(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_owned();
    }
    if let Some(text) = payload.downcast_ref::<String>() {
        return text.clone();
    }
    String::from("non-string panic payload")
}

/// Renders a caught panic as `panic in the driver: <payload>\n<backtrace>`.
pub(crate) fn describe(payload: &(dyn Any + Send)) -> String {
    let trace = LAST_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .unwrap_or_else(|| String::from("<backtrace unavailable>"));
    format!("panic in the driver: {}\n{trace}", payload_text(payload))
}
