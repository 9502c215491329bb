/// Outcome of feeding one validation loss to [`EarlyStopping`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Improved,
    NotImproved,
    Stop,
}

/// Patience-based stopping rule. A loss counts as an improvement only when it
/// is strictly below the best seen so far; NaN never improves.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f64,
    stale: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f64::INFINITY,
            stale: 0,
        }
    }

    pub fn observe(&mut self, loss: f64) -> Verdict {
        if loss < self.best {
            self.best = loss;
            self.stale = 0;
            return Verdict::Improved;
        }
        self.stale += 1;
        if self.stale >= self.patience {
            Verdict::Stop
        } else {
            Verdict::NotImproved
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    /// Consecutive evaluations without improvement.
    pub fn stale_evaluations(&self) -> usize {
        self.stale
    }

    pub fn patience(&self) -> usize {
        self.patience
    }
}
