//! OpenAlgo-style REST broker gateway.
//!
//! Every call is `POST {host}/api/v1/{endpoint}` with a JSON body that
//! carries the account's `apikey`. Responses are wrapped as
//! `{"status": "success" | "error", "data": ..., "message": ...}`.
//!
//! | Operation  | Endpoint     |
//! |------------|--------------|
//! | ping       | `ping`       |
//! | funds      | `funds`      |
//! | place      | `placeorder` |
//! | order book | `orderbook`  |
//! | quote      | `quotes`     |
//! | history    | `history`    |

pub mod client;
pub mod parse;

pub use client::OpenAlgoClient;
