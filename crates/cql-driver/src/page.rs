//! Result-row paging as an async stream, built on [`page_turner::PageTurner`]
//! the same way `flow-client`'s REST pagination wraps a `postgrest::Builder`
//! request into pages: a request type carries its own continuation state
//! (there, an offset; here, the opaque `paging_state` bytes the server
//! hands back), and a thin client type implements `turn_page` to execute
//! one page and decide whether another follows.

use crate::error::DriverError;
use crate::metadata::{Row, RowsMetadata};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use page_turner::{PageTurner, PageTurnerOutput, TurnedPage};
use std::future::Future;
use std::pin::Pin;

/// One page request: the statement-specific closure that executes a
/// single QUERY/EXECUTE with the given paging state attached.
pub struct PageRequest<F> {
    pub paging_state: Option<Bytes>,
    pub execute: F,
}

pub struct Paginator<F> {
    _marker: std::marker::PhantomData<F>,
}

impl<F> Paginator<F> {
    pub fn new() -> Paginator<F> {
        Paginator { _marker: std::marker::PhantomData }
    }
}

impl<F> Default for Paginator<F> {
    fn default() -> Self {
        Self::new()
    }
}

type ExecuteFut = Pin<Box<dyn Future<Output = Result<(RowsMetadata, Vec<Row>), DriverError>> + Send>>;

#[async_trait]
impl<F> PageTurner<PageRequest<F>> for Paginator<F>
where
    F: Fn(Option<Bytes>) -> ExecuteFut + Sync + Send,
{
    type PageItem = Row;
    type PageError = DriverError;

    async fn turn_page(&self, request: PageRequest<F>) -> PageTurnerOutput<Self, PageRequest<F>> {
        let (metadata, rows) = (request.execute)(request.paging_state.clone()).await?;

        match metadata.paging_state {
            Some(next_state) => Ok(TurnedPage::next(
                rows,
                PageRequest {
                    paging_state: Some(next_state),
                    execute: request.execute,
                },
            )),
            None => Ok(TurnedPage::last(rows)),
        }
    }
}

/// Turns a paged QUERY/EXECUTE loop into a single `Stream<Item = Result<Row, DriverError>>`,
/// fetching the next page only once the caller has consumed the current one.
pub fn rows_stream<F>(execute: F) -> impl Stream<Item = Result<Row, DriverError>>
where
    F: Fn(Option<Bytes>) -> ExecuteFut + Sync + Send + 'static,
{
    Paginator::new().into_pages(PageRequest { paging_state: None, execute }).items()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::RowsMetadata;
    use cql_protocol::Value;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn stream_follows_paging_state_until_exhausted() {
        let call_count = Arc::new(AtomicUsize::new(0));
        let cc = call_count.clone();

        let execute = move |state: Option<Bytes>| -> ExecuteFut {
            let call_count = cc.clone();
            Box::pin(async move {
                let n = call_count.fetch_add(1, Ordering::SeqCst);
                match (n, state) {
                    (0, None) => Ok((
                        RowsMetadata {
                            columns: Vec::new(),
                            paging_state: Some(Bytes::from_static(b"page2")),
                            metadata_changed: false,
                            new_metadata_id: None,
                        },
                        vec![Row { columns: vec![Value::Int(1)] }],
                    )),
                    (1, Some(s)) if s == Bytes::from_static(b"page2") => Ok((
                        RowsMetadata {
                            columns: Vec::new(),
                            paging_state: None,
                            metadata_changed: false,
                            new_metadata_id: None,
                        },
                        vec![Row { columns: vec![Value::Int(2)] }],
                    )),
                    other => panic!("unexpected call {other:?}"),
                }
            })
        };

        let rows: Vec<_> = rows_stream(execute).collect().await;
        let rows: Vec<Row> = rows.into_iter().collect::<Result<_, _>>().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].columns[0], Value::Int(1));
        assert_eq!(rows[1].columns[0], Value::Int(2));
    }
}
