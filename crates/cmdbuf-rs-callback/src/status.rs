/// Out-of-band failure slot handed to a custom call by the runtime.
///
/// A callback that fails records a message here instead of returning an error through the C
/// boundary. The slot starts out successful.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CustomCallStatus {
    failure: Option<String>,
}

impl CustomCallStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failure(&mut self, message: impl Into<String>) {
        self.failure = Some(message.into());
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }
}
