// This file is part of Kiln.
//
// Kiln is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Kiln is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Kiln.  If not, see <http://www.gnu.org/licenses/>.

//! Index-addressed containers shared by every runtime subsystem.
//!
//! Everything in here stores values in slotted arrays and links them with
//! `u32` indices rather than references; handles stay valid across growth
//! and the structures can be walked without borrowing each element.

mod dll;
mod hash;
mod hierarchy;
mod pool;

pub use crate::{
    dll::{Dll, DLL_NULL, DLL_STUB},
    hash::{ChainMap, HASH_NULL},
    hierarchy::{DfIter, HierarchyIndex, Links, RemoveReport, HI_NULL_INDEX, HI_ROOT_STUB_INDEX},
    pool::Pool,
};

/// Sentinel for "no slot" in pool-style free lists.
pub const INDEX_NONE: u32 = u32::MAX;
