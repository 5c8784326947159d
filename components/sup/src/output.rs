// Copyright (c) 2016-2017 Chef Software Inc. and/or applicable contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Operator-facing output.
//!
//! One event per line, microsecond-precision timestamps, no color. Every
//! module that emits events declares a two-letter `LOGKEY` so a line can
//! be traced back to its source without a stack trace.

use std::io::{self, Write};

use time;

/// Current wall-clock time formatted with microsecond precision.
pub fn timestamp() -> String {
    let now = time::now();
    match now.strftime("%Y-%m-%d %H:%M:%S") {
        Ok(prefix) => format!("{}.{:06}", prefix, now.tm_nsec / 1000),
        Err(_) => String::from("0000-00-00 00:00:00.000000"),
    }
}

pub fn println(logkey: &str, preamble: Option<&str>, content: &str) {
    let line = match preamble {
        Some(preamble) => {
            format!(
                "{} fleet-sup({})[{}]: {}",
                timestamp(),
                logkey,
                preamble,
                content
            )
        }
        None => format!("{} fleet-sup({}): {}", timestamp(), logkey, content),
    };
    // Losing an output line is not worth crashing the supervisor over.
    writeln!(&mut io::stdout(), "{}", line).ok();
}

#[macro_export]
macro_rules! outputln {
    (preamble $preamble:expr, $content:expr) => {{
        $crate::output::println(LOGKEY, Some(&$preamble.to_string()), &format!("{}", $content))
    }};
    (preamble $preamble:expr, $format:expr, $($arg:tt)+) => {{
        $crate::output::println(LOGKEY, Some(&$preamble.to_string()), &format!($format, $($arg)+))
    }};
    ($content:expr) => {{
        $crate::output::println(LOGKEY, None, &format!("{}", $content))
    }};
    ($format:expr, $($arg:tt)+) => {{
        $crate::output::println(LOGKEY, None, &format!($format, $($arg)+))
    }};
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn timestamp_has_microsecond_field() {
        let stamp = timestamp();
        // e.g. 2017-08-01 12:00:00.123456
        let fraction = stamp.rsplit('.').next().unwrap();
        assert_eq!(fraction.len(), 6);
        assert!(fraction.chars().all(|c| c.is_digit(10)));
    }
}
