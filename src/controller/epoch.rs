/// Epoch captured when a turn or load starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket(u64);

/// Counts navigations. Every change of the active chat advances it, which
/// invalidates every ticket handed out before.
#[derive(Debug, Default)]
pub struct SessionEpoch {
    current: u64,
}

impl SessionEpoch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticket(&self) -> Ticket {
        Ticket(self.current)
    }

    pub fn advance(&mut self) -> Ticket {
        self.current = self.current.wrapping_add(1);
        Ticket(self.current)
    }

    pub fn is_current(&self, ticket: Ticket) -> bool {
        self.current == ticket.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advancing_invalidates_old_tickets() {
        let mut epoch = SessionEpoch::new();
        let first = epoch.ticket();
        assert!(epoch.is_current(first));

        let second = epoch.advance();
        assert!(!epoch.is_current(first));
        assert!(epoch.is_current(second));
        assert_eq!(epoch.ticket(), second);
    }
}
