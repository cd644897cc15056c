// Copyright 2022 CeresDB Project Authors. Licensed under Apache-2.0.

//! Provides utilities for byte arrays

pub use bytes::{Buf, BufMut, Bytes, BytesMut};
