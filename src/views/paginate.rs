/// One page of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
  pub items: Vec<T>,
  /// Requested page, 1-indexed
  pub page: usize,
  pub page_size: usize,
  pub total_pages: usize,
  pub total_items: usize,
  pub has_next: bool,
  pub has_prev: bool,
  /// 1-indexed position of the first item on the page, 0 for an empty page
  pub start_index: usize,
  /// 1-indexed position of the last item on the page, 0 for an empty page
  pub end_index: usize,
}

/// Slice out page `page` (1-indexed) of `items`.
///
/// A page outside `1..=total_pages` is an empty page, not an error.
pub fn paginate<T: Clone>(items: &[T], page: usize, page_size: usize) -> Page<T> {
  let total_items = items.len();
  let total_pages = if page_size == 0 {
    0
  } else {
    total_items.div_ceil(page_size)
  };

  let in_range = page >= 1 && page <= total_pages;
  let (slice, start_index, end_index) = if in_range {
    let offset = (page - 1) * page_size;
    let end = (offset + page_size).min(total_items);
    (&items[offset..end], offset + 1, end)
  } else {
    (&items[..0], 0, 0)
  };

  Page {
    items: slice.to_vec(),
    page,
    page_size,
    total_pages,
    total_items,
    has_next: page < total_pages,
    has_prev: page > 1 && total_pages > 0,
    start_index,
    end_index,
  }
}
