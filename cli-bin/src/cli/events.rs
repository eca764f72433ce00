// src/cli/events.rs
//
// Event names as inotifywait prints and accepts them.

use libkqnotify::EventMask;

/// Name ↔ flag table, in the order names are printed.
pub const NAMES: &[(&str, EventMask)] = &[
    ("ACCESS", EventMask::ACCESS),
    ("MODIFY", EventMask::MODIFY),
    ("ATTRIB", EventMask::ATTRIB),
    ("CLOSE_WRITE", EventMask::CLOSE_WRITE),
    ("CLOSE_NOWRITE", EventMask::CLOSE_NOWRITE),
    ("OPEN", EventMask::OPEN),
    ("MOVED_FROM", EventMask::MOVED_FROM),
    ("MOVED_TO", EventMask::MOVED_TO),
    ("CREATE", EventMask::CREATE),
    ("DELETE", EventMask::DELETE),
    ("DELETE_SELF", EventMask::DELETE_SELF),
    ("MOVE_SELF", EventMask::MOVE_SELF),
    ("UNMOUNT", EventMask::UNMOUNT),
    ("Q_OVERFLOW", EventMask::Q_OVERFLOW),
    ("IGNORED", EventMask::IGNORED),
    ("ISDIR", EventMask::ISDIR),
];

/// Group names accepted by `--event` on top of the single flags.
const GROUPS: &[(&str, EventMask)] = &[
    ("CLOSE", EventMask::CLOSE),
    ("MOVE", EventMask::MOVE),
    ("ALL_EVENTS", EventMask::ALL_EVENTS),
];

/// Parse one `--event` value, case-insensitively, with or without `IN_`.
pub fn parse(name: &str) -> Option<EventMask> {
    let upper = name.trim().to_ascii_uppercase();
    let bare = upper.strip_prefix("IN_").unwrap_or(&upper);
    NAMES
        .iter()
        .chain(GROUPS)
        .find(|(n, _)| *n == bare)
        .map(|(_, m)| *m)
        .filter(|m| m.intersects(EventMask::ALL_EVENTS))
}

/// Names of every flag set in `mask`.
pub fn names(mask: EventMask) -> Vec<&'static str> {
    NAMES
        .iter()
        .filter(|(_, m)| mask.contains(*m))
        .map(|(n, _)| *n)
        .collect()
}
