use bitflags::bitflags;

bitflags! {
    /// Joint running status of a markov chain's two exes.
    ///
    /// Bit 0 is set while exe A runs, bit 1 while exe B runs, so the bits
    /// value doubles as the state index 0..=3.
    #[repr(transparent)]
    #[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord)]
    pub struct MarkovState: u8 {
        const NeitherRunning = 0b00;
        const ExeARunning = 0b01;
        const ExeBRunning = 0b10;
        const BothRunning = 0b11;
    }
}

impl Default for MarkovState {
    fn default() -> Self {
        Self::NeitherRunning
    }
}

impl MarkovState {
    pub const fn from_running(a: bool, b: bool) -> Self {
        match (a, b) {
            (false, false) => Self::NeitherRunning,
            (true, false) => Self::ExeARunning,
            (false, true) => Self::ExeBRunning,
            (true, true) => Self::BothRunning,
        }
    }

    pub const fn index(self) -> usize {
        self.bits() as usize
    }

    pub fn from_index(index: usize) -> Option<Self> {
        u8::try_from(index).ok().and_then(Self::from_bits)
    }
}
