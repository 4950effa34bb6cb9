use rand::Rng;

/// Free private-network addresses for one provisioning run. Every draw
/// removes the address, so the same one is never handed out twice.
#[derive(Debug, Clone, Default)]
pub struct AddressPool {
    available: Vec<String>,
}

impl AddressPool {
    pub fn new(addresses: impl IntoIterator<Item = String>) -> Self {
        let mut available: Vec<String> = addresses.into_iter().collect();
        available.sort();
        available.dedup();
        Self { available }
    }

    /// Uniform-random draw without replacement.
    pub fn draw(&mut self) -> Option<String> {
        self.draw_with(&mut rand::thread_rng())
    }

    pub fn draw_with<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<String> {
        if self.available.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..self.available.len());
        Some(self.available.swap_remove(index))
    }

    pub fn remaining(&self) -> usize {
        self.available.len()
    }
}
