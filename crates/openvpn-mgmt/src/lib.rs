//! # openvpn-mgmt
//!
//! Client for the OpenVPN management interface: launches OpenVPN, attaches
//! to its management socket, and exposes commands and real-time events.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **types** | Shared enums, status read model, errors, event payloads |
//! | **protocol** | Line classification, response decoding, command builders |
//! | **auth** | `>CLIENT:` event, env and identifier parsing |
//! | **middleware** | `Middleware` trait and ordered chain |
//! | **management** | Socket read loop, command correlation, teardown |
//! | **config** | Client configuration, management address, dial retry |
//! | **process** | OpenVPN binary lifecycle – spawn, reap, kill, version |
//! | **client** | Start / stop / wait state machine |
//! | **state** | Tunnel state tracker middleware |
//! | **password** | `>PASSWORD:` prompt answering middleware |
//! | **server_auth** | Server-side client-auth middleware |

pub mod openvpn;
