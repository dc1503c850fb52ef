//! Page-by-page replication of remote tables into the local store.
//!
//! Tables are read in batches of at most [`PAGE_SIZE`] rows, ordered by a
//! strictly increasing numeric id column that doubles as the pagination
//! cursor. Batches are processed strictly sequentially; the next page is
//! not fetched until the previous batch has been handed off.

use serde_json::Value;

use crate::remote::{RemoteError, TableSource};

/// Maximum rows fetched per page.
pub const PAGE_SIZE: usize = 1000;

/// Errors that abort a table's replication.
#[derive(Debug, thiserror::Error)]
pub enum ReplicateError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("pagination cursor did not advance past {at:?} on a full page of {table}")]
    CursorStalled { table: String, at: Option<i64> },
}

/// Fetch every row of `table`, handing each batch to `on_batch` before the
/// next page is requested. Returns the total number of rows fetched.
///
/// Termination: the loop continues while the last fetched page was exactly
/// full and stops on the first short page. Paging with a `> cursor` filter
/// assumes the order column is unique; duplicate values straddling a page
/// boundary would be skipped. That is an accepted property of the order
/// column (a primary key), not something this function compensates for.
///
/// The first failed page aborts the whole replication for the table; there
/// is no partial-failure retry. Row-level problems inside a batch are the
/// caller's concern and must not abort the loop.
pub async fn page_through<F>(
    source: &dyn TableSource,
    table: &str,
    columns: &str,
    order_column: &str,
    mut on_batch: F,
) -> Result<usize, ReplicateError>
where
    F: FnMut(Vec<Value>),
{
    let mut total = 0usize;
    let mut cursor: Option<i64> = None;

    loop {
        let rows = source
            .fetch_rows(table, columns, order_column, cursor, PAGE_SIZE)
            .await?;
        let fetched = rows.len();
        total += fetched;

        let next_cursor = rows
            .last()
            .and_then(|row| row.get(order_column))
            .and_then(Value::as_i64)
            .or(cursor);

        log::debug!("replicated {fetched} rows of {table} (cursor {cursor:?})");
        on_batch(rows);

        if fetched < PAGE_SIZE {
            return Ok(total);
        }

        // a full page that cannot advance the cursor would refetch forever
        if next_cursor == cursor {
            return Err(ReplicateError::CursorStalled {
                table: table.to_string(),
                at: cursor,
            });
        }
        cursor = next_cursor;
    }
}
