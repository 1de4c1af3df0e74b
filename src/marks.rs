//! Marks understood by the `%language-server` agent.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mark {
    Request,
    Notification,
    Response,
}

impl Mark {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mark::Request => "language-server-rpc-request",
            Mark::Notification => "language-server-rpc-notification",
            Mark::Response => "language-server-rpc-response",
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mark {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "language-server-rpc-request" => Ok(Mark::Request),
            "language-server-rpc-notification" => Ok(Mark::Notification),
            "language-server-rpc-response" => Ok(Mark::Response),
            _ => Err(()),
        }
    }
}
