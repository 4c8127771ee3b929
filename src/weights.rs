use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::error::{CoreResult, LoggerError};

pub const GRID_CELLS: usize = 9;

/// Amount added or removed by one adjust step
pub const WEIGHT_STEP: i64 = 20;

/// 3x3 load grid, row-major
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightGrid {
    cells: [i64; GRID_CELLS],
}

impl WeightGrid {
    pub fn cells(&self) -> [i64; GRID_CELLS] {
        self.cells
    }

    pub fn get(&self, cell: usize) -> CoreResult<i64> {
        self.cells
            .get(cell)
            .copied()
            .ok_or(LoggerError::InvalidCell(cell))
    }

    /// Add `delta`; a cell never drops below zero
    pub fn adjust(&mut self, cell: usize, delta: i64) -> CoreResult<i64> {
        let slot = self
            .cells
            .get_mut(cell)
            .ok_or(LoggerError::InvalidCell(cell))?;
        *slot = slot.saturating_add(delta).max(0);
        Ok(*slot)
    }

    pub fn set(&mut self, cell: usize, value: i64) -> CoreResult<()> {
        if value < 0 {
            return Err(LoggerError::InvalidCell(cell));
        }
        let slot = self
            .cells
            .get_mut(cell)
            .ok_or(LoggerError::InvalidCell(cell))?;
        *slot = value;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.cells = [0; GRID_CELLS];
    }
}

impl fmt::Display for WeightGrid {
    /// `[0, 20, 0, ...]`, the format written to the weight column
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, cell) in self.cells.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", cell)?;
        }
        f.write_str("]")
    }
}

impl FromStr for WeightGrid {
    type Err = LoggerError;

    /// Inverse of `Display`; used when replaying a saved session
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| LoggerError::Config(format!("not a weight grid: {}", s)))?;

        let mut grid = WeightGrid::default();
        let mut count = 0;
        for (i, cell) in inner.split(',').enumerate() {
            let value: i64 = cell
                .trim()
                .parse()
                .map_err(|_| LoggerError::Config(format!("bad weight {:?} in {}", cell.trim(), s)))?;
            grid.set(i, value)?;
            count += 1;
        }
        if count != GRID_CELLS {
            return Err(LoggerError::Config(format!(
                "expected {} weights, found {}",
                GRID_CELLS, count
            )));
        }
        Ok(grid)
    }
}

/// Handle shared between the operator surface (writer) and the router (reader)
#[derive(Debug, Clone, Default)]
pub struct SharedWeights {
    grid: Arc<Mutex<WeightGrid>>,
}

impl SharedWeights {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CoreResult<WeightGrid> {
        let grid = self.grid.lock().map_err(|_| LoggerError::poisoned("weights"))?;
        Ok(*grid)
    }

    pub fn adjust(&self, cell: usize, delta: i64) -> CoreResult<i64> {
        let mut grid = self.grid.lock().map_err(|_| LoggerError::poisoned("weights"))?;
        grid.adjust(cell, delta)
    }

    pub fn set(&self, cell: usize, value: i64) -> CoreResult<()> {
        let mut grid = self.grid.lock().map_err(|_| LoggerError::poisoned("weights"))?;
        grid.set(cell, value)
    }

    pub fn reset(&self) -> CoreResult<()> {
        let mut grid = self.grid.lock().map_err(|_| LoggerError::poisoned("weights"))?;
        grid.reset();
        Ok(())
    }

    /// Swap in a whole grid, e.g. one read back from a saved session
    pub fn replace(&self, next: WeightGrid) -> CoreResult<()> {
        let mut grid = self.grid.lock().map_err(|_| LoggerError::poisoned("weights"))?;
        *grid = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_clamps_at_zero() {
        let mut grid = WeightGrid::default();
        assert_eq!(grid.adjust(4, WEIGHT_STEP).unwrap(), 20);
        assert_eq!(grid.adjust(4, WEIGHT_STEP).unwrap(), 40);
        assert_eq!(grid.adjust(4, -WEIGHT_STEP).unwrap(), 20);
        assert_eq!(grid.adjust(4, -WEIGHT_STEP).unwrap(), 0);
        assert_eq!(grid.adjust(4, -WEIGHT_STEP).unwrap(), 0);
    }

    #[test]
    fn test_invalid_cells() {
        let mut grid = WeightGrid::default();
        assert_eq!(grid.adjust(9, 1), Err(LoggerError::InvalidCell(9)));
        assert!(grid.set(0, -5).is_err());
    }

    #[test]
    fn test_adjust_saturates_at_the_top() {
        let mut grid = WeightGrid::default();
        grid.set(0, i64::MAX).unwrap();
        assert_eq!(grid.adjust(0, WEIGHT_STEP).unwrap(), i64::MAX);
        assert_eq!(grid.adjust(0, -WEIGHT_STEP).unwrap(), i64::MAX - 20);
        assert_eq!(grid.adjust(1, i64::MIN).unwrap(), 0);

        let shared = SharedWeights::new();
        shared.set(4, i64::MAX - 1).unwrap();
        assert_eq!(shared.adjust(4, WEIGHT_STEP).unwrap(), i64::MAX);
    }

    #[test]
    fn test_display_matches_log_column() {
        let mut grid = WeightGrid::default();
        grid.set(1, 40).unwrap();
        assert_eq!(grid.to_string(), "[0, 40, 0, 0, 0, 0, 0, 0, 0]");
    }

    #[test]
    fn test_parse_log_column() {
        let grid: WeightGrid = "[0, 40, 0, 0, 0, 0, 0, 0, 20]".parse().unwrap();
        assert_eq!(grid.get(1).unwrap(), 40);
        assert_eq!(grid.get(8).unwrap(), 20);
        assert!("[1, 2]".parse::<WeightGrid>().is_err());
        assert!("0, 0".parse::<WeightGrid>().is_err());
        assert!("[0, 0, 0, 0, 0, 0, 0, 0, 0, 0]".parse::<WeightGrid>().is_err());
    }

    #[test]
    fn test_shared_reset() {
        let shared = SharedWeights::new();
        shared.adjust(0, WEIGHT_STEP).unwrap();
        shared.set(8, 7).unwrap();
        assert_eq!(shared.snapshot().unwrap().get(8).unwrap(), 7);
        shared.reset().unwrap();
        assert_eq!(shared.snapshot().unwrap(), WeightGrid::default());
    }
}
