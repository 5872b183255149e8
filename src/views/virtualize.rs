//! Windowing for long lists: render only what is on screen plus a small buffer.

/// The slice of a list to render, as a half-open index range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VirtualWindow {
  pub start: usize,
  pub end: usize,
  /// Number of rows in the window, `end - start`
  pub visible_items: usize,
  /// Pixel offset of the first rendered row
  pub offset_y: f64,
  /// Height of the whole list, for the scroll container
  pub total_height: f64,
}

/// Largest number of buffer rows added on each side of the visible range.
pub const MAX_BUFFER: usize = 5;

/// Compute the rows to render for a viewport scrolled to `scroll_top`.
///
/// The buffer on each side is `min(MAX_BUFFER, visible / 4)` rows. The window never
/// starts below 0 or ends beyond `item_count`, whatever the inputs.
pub fn virtualize_window(
  item_count: usize,
  item_height: f64,
  viewport_height: f64,
  scroll_top: f64,
) -> VirtualWindow {
  if item_count == 0 || !(item_height > 0.0) {
    return VirtualWindow {
      start: 0,
      end: 0,
      visible_items: 0,
      offset_y: 0.0,
      total_height: 0.0,
    };
  }

  let visible = to_index((viewport_height / item_height).ceil());
  let first = to_index((scroll_top / item_height).floor()).min(item_count);
  let last = first.saturating_add(visible).saturating_add(1).min(item_count);

  let buffer = MAX_BUFFER.min(visible / 4);
  let start = first.saturating_sub(buffer);
  let end = last.saturating_add(buffer).min(item_count);

  VirtualWindow {
    start,
    end,
    visible_items: end - start,
    offset_y: start as f64 * item_height,
    total_height: item_count as f64 * item_height,
  }
}

/// Non-negative finite float to index; negatives and NaN become 0.
fn to_index(value: f64) -> usize {
  if value.is_finite() && value > 0.0 {
    value as usize
  } else if value == f64::INFINITY {
    usize::MAX
  } else {
    0
  }
}
