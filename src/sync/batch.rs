//! Request size adjustment for central-service posts.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("item {index} serializes to {size} bytes, above the {threshold} byte limit")]
    ItemTooLarge {
        index: usize,
        size: usize,
        threshold: usize,
    },
    #[error("batch could not be serialized: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Splits `items` into the fewest contiguous slices whose JSON encoding fits
/// `threshold` bytes.
///
/// Tries 1, 2, 3... equal slices, the last one taking the remainder, until every
/// slice fits. A single item that does not fit on its own is an error.
pub fn adjust_request_size<T: Serialize>(
    items: &[T],
    threshold: usize,
) -> Result<Vec<&[T]>, BatchError> {
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let mut divisor = 1;
    loop {
        let chunks = split(items, divisor);
        let mut fits = true;
        let mut offset = 0;
        for chunk in &chunks {
            let size = serde_json::to_vec(chunk)?.len();
            if size > threshold {
                if chunk.len() == 1 {
                    return Err(BatchError::ItemTooLarge {
                        index: offset,
                        size,
                        threshold,
                    });
                }
                fits = false;
                break;
            }
            offset += chunk.len();
        }
        if fits {
            return Ok(chunks);
        }
        divisor += 1;
    }
}

fn split<T>(items: &[T], divisor: usize) -> Vec<&[T]> {
    let size = items.len() / divisor;
    let mut chunks = Vec::with_capacity(divisor);
    for i in 0..divisor {
        let start = i * size;
        let end = if i + 1 == divisor { items.len() } else { start + size };
        chunks.push(&items[start..end]);
    }
    chunks
}
