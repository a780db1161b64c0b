// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Named time spans for multi-step flows. Extend completions log one clock
//! covering the wait since the threshold event plus each pipeline stage.

use std::fmt;
use std::time::Duration;
use std::time::Instant;

struct Span {
    name: &'static str,
    start: Instant,
    elapsed: Option<Duration>,
}

/// A set of named spans. Spans may overlap; a span left running renders
/// with a `*` marker.
#[derive(Default)]
pub struct Clock {
    spans: Vec<Span>,
}

impl Clock {
    pub fn new() -> Self {
        Clock::default()
    }

    pub fn start(&mut self, name: &'static str) {
        self.start_at(name, Instant::now());
    }

    /// Start a span retroactively, e.g. from the moment a threshold event
    /// was received.
    pub fn start_at(&mut self, name: &'static str, start: Instant) {
        self.spans.push(Span {
            name,
            start,
            elapsed: None,
        });
    }

    pub fn stop(&mut self, name: &'static str) {
        if let Some(span) = self
            .spans
            .iter_mut()
            .find(|span| span.name == name && span.elapsed.is_none())
        {
            span.elapsed = Some(span.start.elapsed());
        }
    }
}

impl fmt::Display for Clock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "<Clock(")?;
        for (i, span) in self.spans.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match span.elapsed {
                Some(elapsed) => write!(f, "{}={:.2}", span.name, elapsed.as_secs_f64())?,
                None => write!(f, "{}={:.2}*", span.name, span.start.elapsed().as_secs_f64())?,
            }
        }
        write!(f, ")>")
    }
}
