// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Book service fixtures
//!
//! Message types are bincode-encoded. `BookService` exposes `GetBook`
//! (unary) and `QueryBooks` (server stream); `BookCatalog` exposes
//! `AddBooks` (client stream) and `RenameBooks` (bidirectional).

use std::sync::Arc;

use bincode::{Decode, Encode};
use futures::stream::{self, StreamExt};
use portrpc::{
    Decoder, Encoder, RequestContext, RequestStream, Result, RpcError, RpcServerPort,
    ServiceModule,
};

fn encode<T: Encode>(value: &T) -> Result<bytes::Bytes> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map(bytes::Bytes::from)
        .map_err(|e| RpcError::Codec(format!("Encoding error: {}", e)))
}

fn decode<T: Decode<()>>(buf: &[u8]) -> Result<T> {
    let (decoded, _len): (T, usize) = bincode::decode_from_slice(buf, bincode::config::standard())
        .map_err(|e| RpcError::Codec(format!("Decoding error: {}", e)))?;
    Ok(decoded)
}

macro_rules! bincode_codec {
    ($($ty:ty),+) => {
        $(
            impl Encoder for $ty {
                fn encode(&self) -> Result<bytes::Bytes> {
                    encode(self)
                }
            }

            impl Decoder for $ty {
                fn decode(buf: &[u8]) -> Result<Self> {
                    decode(buf)
                }
            }
        )+
    };
}

#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct Book {
    pub isbn: u64,
    pub title: String,
    pub author: String,
}

impl Book {
    pub fn new(isbn: u64, title: &str, author: &str) -> Self {
        Book {
            isbn,
            title: title.to_string(),
            author: author.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct GetBookRequest {
    pub isbn: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Encode, Decode)]
pub struct QueryBooksRequest {
    pub author_prefix: String,
}

bincode_codec!(Book, GetBookRequest, QueryBooksRequest);

/// Per-transport server context: the books known to the server.
#[derive(Debug, Clone, Default)]
pub struct Library {
    pub books: Vec<Book>,
}

impl Library {
    pub fn new(books: Vec<Book>) -> Self {
        Library { books }
    }

    /// Five books by two authors.
    pub fn sample() -> Self {
        Library::new(vec![
            Book::new(1234, "Rust in Action", "McNamara"),
            Book::new(2345, "Programming Rust", "Blandy"),
            Book::new(3456, "Zero To Production", "Palmieri"),
            Book::new(4567, "Hands-on Rust", "Wolverson"),
            Book::new(5678, "Rust Atomics and Locks", "Bos"),
        ])
    }
}

pub const BOOK_SERVICE: &str = "BookService";
pub const BOOK_CATALOG: &str = "BookCatalog";

async fn get_book(request: GetBookRequest, ctx: RequestContext<Library>) -> Result<Book> {
    tracing::debug!(isbn = request.isbn, "GetBook");
    Ok(ctx
        .context()
        .books
        .iter()
        .find(|book| book.isbn == request.isbn)
        .cloned()
        .unwrap_or_default())
}

async fn query_books(
    request: QueryBooksRequest,
    ctx: RequestContext<Library>,
) -> Result<RequestStream<Book>> {
    let books: Vec<Result<Book>> = ctx
        .context()
        .books
        .iter()
        .filter(|book| book.author.starts_with(&request.author_prefix))
        .cloned()
        .map(Ok)
        .collect();
    Ok(stream::iter(books).boxed())
}

/// Returns the last book received with a known isbn.
async fn add_books(mut books: RequestStream<Book>, _ctx: RequestContext<Library>) -> Result<Book> {
    let mut last = Book::default();
    while let Some(book) = books.next().await {
        let book = book?;
        if book.isbn != 0 {
            last = book;
        }
    }
    Ok(last)
}

async fn rename_books(
    books: RequestStream<Book>,
    _ctx: RequestContext<Library>,
) -> Result<RequestStream<Book>> {
    let renamed = async_stream::try_stream! {
        for await book in books {
            let mut book = book?;
            book.title = book.title.to_uppercase();
            yield book;
        }
    };
    Ok(renamed.boxed())
}

pub fn book_service() -> ServiceModule<Library> {
    ServiceModule::new()
        .unary("GetBook", get_book)
        .server_stream("QueryBooks", query_books)
}

pub fn book_catalog() -> ServiceModule<Library> {
    ServiceModule::new()
        .client_stream("AddBooks", add_books)
        .bidirectional_stream("RenameBooks", rename_books)
}

/// Port handler registering both book modules.
pub async fn register_book_modules(
    port: RpcServerPort<Library>,
    _library: Arc<Library>,
) -> Result<()> {
    port.register_module(BOOK_SERVICE, |_| async { Ok(book_service()) })?;
    port.register_module(BOOK_CATALOG, |_| async { Ok(book_catalog()) })?;
    Ok(())
}
