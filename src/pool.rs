//! Process-lifetime free-lists for response records, stream tokens and
//! buffered token channels.
//!
//! One generic [`Pool`] covers all three kinds. Objects are recycled on
//! reinsertion; an object that reports itself unfit for reuse (a closed
//! channel) is dropped instead of reinserted.

use std::sync::{LazyLock, Mutex};

use tokio::sync::mpsc;

use crate::model::{Response, Token};

/// Buffer size of pooled token channels.
const TOKEN_CHANNEL_CAPACITY: usize = 32;

const RESPONSE_POOL_CAP: usize = 64;
const TOKEN_POOL_CAP: usize = 1024;
const CHANNEL_POOL_CAP: usize = 16;

/// An object that can rejoin a free-list after use.
pub trait Recyclable {
    /// Restore the object to its blank state.
    fn recycle(&mut self);

    /// Whether the object is still fit for reuse. Unfit objects are dropped
    /// by [`Pool::put`].
    fn reusable(&self) -> bool {
        true
    }
}

impl Recyclable for Response {
    fn recycle(&mut self) {
        self.reset();
    }
}

impl Recyclable for Token {
    fn recycle(&mut self) {
        self.reset();
    }
}

/// A buffered token channel pair handed out to streaming calls.
///
/// Once the stream terminates the receiver is dropped, which closes the
/// channel; `reusable` then reports false so the pool never hands out a
/// dead channel.
pub struct TokenChannel {
    pub tx: mpsc::Sender<Token>,
    pub rx: mpsc::Receiver<Token>,
}

impl TokenChannel {
    fn fresh() -> Self {
        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        Self { tx, rx }
    }
}

impl Recyclable for TokenChannel {
    fn recycle(&mut self) {
        while self.rx.try_recv().is_ok() {}
    }

    fn reusable(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A bounded free-list. `get` pops or constructs; `put` recycles and
/// reinserts unless the object is unfit or the list is full.
pub struct Pool<T> {
    items: Mutex<Vec<T>>,
    make: fn() -> T,
    cap: usize,
}

impl<T: Recyclable> Pool<T> {
    pub fn new(cap: usize, make: fn() -> T) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            make,
            cap,
        }
    }

    pub fn get(&self) -> T {
        self.items
            .lock()
            .expect("poisoned lock")
            .pop()
            .unwrap_or_else(self.make)
    }

    pub fn put(&self, mut item: T) {
        if !item.reusable() {
            return;
        }
        item.recycle();
        let mut items = self.items.lock().expect("poisoned lock");
        if items.len() < self.cap {
            items.push(item);
        }
    }

    pub fn size(&self) -> usize {
        self.items.lock().expect("poisoned lock").len()
    }
}

static RESPONSE_POOL: LazyLock<Pool<Response>> =
    LazyLock::new(|| Pool::new(RESPONSE_POOL_CAP, Response::default));
static TOKEN_POOL: LazyLock<Pool<Token>> =
    LazyLock::new(|| Pool::new(TOKEN_POOL_CAP, Token::default));
static CHANNEL_POOL: LazyLock<Pool<TokenChannel>> =
    LazyLock::new(|| Pool::new(CHANNEL_POOL_CAP, TokenChannel::fresh));

pub fn response_pool() -> &'static Pool<Response> {
    &RESPONSE_POOL
}

pub fn token_pool() -> &'static Pool<Token> {
    &TOKEN_POOL
}

pub fn channel_pool() -> &'static Pool<TokenChannel> {
    &CHANNEL_POOL
}

/// Hand a response record back for reuse.
pub fn release_response(response: Response) {
    response_pool().put(response);
}

/// Hand a stream token back for reuse.
pub fn release_token(token: Token) {
    token_pool().put(token);
}
