//! Request/response API over the connection pool.
//!
//! ```text
//!  execute ──► pool.borrow ──miss──► connector.connect
//!                 │                        │
//!                 └──────► write request ◄─┘
//!                               │
//!                        read response head
//!                               │
//!                        ResponseHandle ──release──► drain ──► pool.put
//!                                   │                   └────► close
//!                                   └── drop ──► close (abandoned)
//! ```
//!
//! # Example
//!
//! ```no_run
//! use tether::client::RequestExecutor;
//! use tether::config::Config;
//! use tether::http::request::Request;
//!
//! # async fn run() -> tether::error::Result<()> {
//! let executor = RequestExecutor::with_tcp(&Config::default());
//! let mut response = executor.execute(Request::get("http://example.com/")?).await?;
//! println!("{}", response.status());
//! response.release().await?;
//! # Ok(())
//! # }
//! ```

pub mod executor;
pub mod handle;

pub use executor::RequestExecutor;
pub use handle::{ReleaseOutcome, ResponseHandle};
