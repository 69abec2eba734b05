//! Parser for the host runtime's announcement strings.
//!
//! The host signals guest lifecycle events by emitting debug strings of the
//! form
//!
//! ```text
//! {7AA7C9CF-89EC-4ed3-8DAD-6DC84302AB11} -version 1 -event AppCreate \
//!     -nap 0x1cd3f0 -mem_start 0xC00000000 -user_entry_pt 0x20080 ...
//! ```
//!
//! Only strings carrying the fixed UUID prefix are announcements; everything
//! else is ordinary debuggee output.

/// The host runtime's "this is me" marker.
pub const HOST_RUNTIME_UUID: &str = "{7AA7C9CF-89EC-4ed3-8DAD-6DC84302AB11}";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Announcement {
    /// The guest application is loaded; carries where the sandbox lives and
    /// where user code starts.
    AppCreate { mem_start: u64, user_entry: u64 },
    /// The announcing thread is about to start running guest code.
    ThreadCreate,
    /// Recognised host traffic with no state attached (`ThreadExit`,
    /// `AppExit`, future event names).
    Other,
}

/// Parses a debug string. `None` means the string is not host traffic at all.
pub fn parse(text: &str) -> Option<Announcement> {
    let rest = text.strip_prefix(HOST_RUNTIME_UUID)?;

    match switch_value(rest, "-event") {
        Some("AppCreate") => Some(Announcement::AppCreate {
            mem_start: switch_value(rest, "-mem_start").and_then(parse_pointer)?,
            user_entry: switch_value(rest, "-user_entry_pt").and_then(parse_pointer)?,
        }),
        Some("ThreadCreate") => Some(Announcement::ThreadCreate),
        _ => Some(Announcement::Other),
    }
}

/// The value following a `-switch` token, if any.
fn switch_value<'a>(text: &'a str, switch: &str) -> Option<&'a str> {
    let mut tokens = text.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == switch {
            return tokens.next();
        }
    }
    None
}

/// Pointers appear both as `0xC00000000` and as bare zero-padded hex.
fn parse_pointer(token: &str) -> Option<u64> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP_CREATE: &str = "{7AA7C9CF-89EC-4ed3-8DAD-6DC84302AB11} -version 1 \
         -event AppCreate -nap 00000000001CD3F0 -mem_start 0xC00000000 \
         -user_entry_pt 0x20080 -initial_entry_pt 0x8000080";

    #[test]
    fn app_create_carries_base_and_entry() {
        assert_eq!(
            Some(Announcement::AppCreate {
                mem_start: 0xc00000000,
                user_entry: 0x20080,
            }),
            parse(APP_CREATE)
        );
    }

    #[test]
    fn zero_padded_pointers_parse() {
        let text = "{7AA7C9CF-89EC-4ed3-8DAD-6DC84302AB11} -version 1 \
             -event AppCreate -mem_start 0000000C00000000 -user_entry_pt 0000000000020080";
        assert_eq!(
            Some(Announcement::AppCreate {
                mem_start: 0xc00000000,
                user_entry: 0x20080,
            }),
            parse(text)
        );
    }

    #[test]
    fn thread_create() {
        let text = "{7AA7C9CF-89EC-4ed3-8DAD-6DC84302AB11} -version 1 \
             -event ThreadCreate -natp 00000000001CD3F0 ";
        assert_eq!(Some(Announcement::ThreadCreate), parse(text));
    }

    #[test]
    fn other_host_events_are_recognised_but_carry_nothing() {
        let text = "{7AA7C9CF-89EC-4ed3-8DAD-6DC84302AB11} -version 1 \
             -event ThreadExit -natp 00000000001CD3F0 -exit_code 0";
        assert_eq!(Some(Announcement::Other), parse(text));
    }

    #[test]
    fn ordinary_output_is_not_an_announcement() {
        assert_eq!(None, parse("hello from the debuggee"));
        assert_eq!(None, parse(""));
    }

    #[test]
    fn app_create_without_pointers_is_not_valid() {
        let text = "{7AA7C9CF-89EC-4ed3-8DAD-6DC84302AB11} -event AppCreate";
        assert_eq!(None, parse(text));
    }
}
