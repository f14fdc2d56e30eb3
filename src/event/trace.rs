use std::{fmt, panic::Location};

/// Collects the chain of promises and futures a suspended computation is blocked on.
///
/// Built on demand by [`Promise::trace`](crate::Promise::trace) for debugging hangs. Nodes add
/// themselves outermost first.
#[derive(Default, Debug)]
pub struct TraceBuilder {
    entries: Vec<String>,
}

impl TraceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, what: &str, location: Option<&'static Location<'static>>) {
        self.entries.push(match location {
            Some(location) => format!("{} at {}", what, location),
            None => String::from(what),
        });
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for TraceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, entry) in self.entries.iter().enumerate() {
            if index > 0 {
                f.write_str("\n")?;
            }
            f.write_str(entry)?;
        }
        Ok(())
    }
}
