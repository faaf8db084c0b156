use super::constants::MAX_SKIPPED_ACKNOWLEDGMENTS;
use super::destination::Destination;
use super::error::SyncWindowError;
use super::register_client::RegisterClient;
use super::transport::Transport;

/// SyncWindow bounds the number of waiting writes in flight on one destination.
///
/// Call `take()` before each waiting write. Once `capacity` writes are outstanding, `take()`
/// blocks draining one acknowledgment before granting the slot. `clear()` drains everything
/// still outstanding. A window dropped with writes outstanding clears itself.
#[derive(Debug)]
pub struct SyncWindow<'a, T: Transport> {
    client: &'a RegisterClient<T>,
    destination: Destination,
    capacity: usize,
    depth: usize,
    histogram: Vec<u32>,
}

impl<'a, T: Transport> SyncWindow<'a, T> {
    /// A window of at least one slot
    pub fn new(client: &'a RegisterClient<T>, destination: Destination, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            client,
            destination,
            capacity,
            depth: 0,
            histogram: vec![0; capacity + 1],
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// How many times each depth was observed after a `take()`
    pub fn histogram(&self) -> &[u32] {
        &self.histogram
    }

    /// Reserve a slot for the next waiting write
    pub fn take(&mut self) -> Result<(), SyncWindowError> {
        if self.depth == self.capacity {
            self.drain_one()?;
            self.depth -= 1;
        }
        self.depth += 1;
        self.histogram[self.depth] += 1;
        Ok(())
    }

    /// Drain all outstanding acknowledgments. Depth is zero afterwards even if some
    /// acknowledgments never arrived; the first such failure is returned.
    pub fn clear(&mut self) -> Result<(), SyncWindowError> {
        let mut result = Ok(());
        while self.depth > 0 {
            if let Err(e) = self.drain_one() {
                spdlog::warn!(
                    "SyncWindow on {} lost an acknowledgment with depth {}: {}",
                    self.destination,
                    self.depth,
                    e
                );
                if result.is_ok() {
                    result = Err(e);
                }
            }
            self.depth -= 1;
        }
        self.log_histogram();
        result
    }

    /// Receive until a waiting acknowledgment arrives, skipping a bounded number of others
    fn drain_one(&self) -> Result<(), SyncWindowError> {
        let mut skipped = 0;
        while skipped < MAX_SKIPPED_ACKNOWLEDGMENTS {
            match self.client.receive()? {
                Some(response) if response.header.waiting => {
                    self.client.check_status(
                        response.header.destination,
                        response.header.address,
                        &response.status,
                    )?;
                    return Ok(());
                }
                Some(_) => skipped += 1,
                None => break,
            }
        }
        Err(SyncWindowError::MissingAcknowledgment(skipped))
    }

    fn log_histogram(&self) {
        let entries: Vec<String> = self
            .histogram
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(depth, count)| format!("{depth}:{count}"))
            .collect();
        if !entries.is_empty() {
            spdlog::debug!(
                "SyncWindow on {} depth histogram {}",
                self.destination,
                entries.join(" ")
            );
        }
    }
}

impl<T: Transport> Drop for SyncWindow<'_, T> {
    fn drop(&mut self) {
        if self.depth > 0 {
            let _ = self.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::VirtualChannel;
    use crate::sim::SimFrontEnd;

    fn registers() -> Destination {
        Destination::new(0, VirtualChannel::Registers)
    }

    #[test]
    fn test_depth_never_exceeds_capacity() {
        let sim = SimFrontEnd::new();
        let client = RegisterClient::new(sim.transport());
        let mut window = SyncWindow::new(&client, registers(), 3);
        for value in 0..20 {
            window.take().unwrap();
            assert!(window.depth() <= window.capacity());
            client
                .write_register(registers(), 0x100 + value, value, true)
                .unwrap();
        }
        assert_eq!(window.depth(), 3);
        window.clear().unwrap();
        assert_eq!(window.depth(), 0);
        // every acknowledgment was consumed
        assert!(client.receive().unwrap().is_none());
        assert_eq!(window.histogram()[3], 18);
    }

    #[test]
    fn test_missing_acknowledgment() {
        let sim = SimFrontEnd::new();
        sim.state().faults.drop_acknowledgments = true;
        let client = RegisterClient::new(sim.transport());
        let mut window = SyncWindow::new(&client, registers(), 1);
        window.take().unwrap();
        client.write_register(registers(), 0x1, 1, true).unwrap();
        assert!(matches!(
            window.take(),
            Err(SyncWindowError::MissingAcknowledgment(0))
        ));
        assert_eq!(window.depth(), 1);
        assert!(window.clear().is_err());
        assert_eq!(window.depth(), 0);
    }

    #[test]
    fn test_drop_drains() {
        let sim = SimFrontEnd::new();
        let client = RegisterClient::new(sim.transport());
        {
            let mut window = SyncWindow::new(&client, registers(), 4);
            for value in 0..2 {
                window.take().unwrap();
                client.write_register(registers(), 0x10, value, true).unwrap();
            }
        }
        assert!(client.receive().unwrap().is_none());
    }
}
