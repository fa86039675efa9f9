//! # Internal Macros
//!
//! ## zerocopy_accessors!
//!
//! On-disk headers are zerocopy structs with little-endian wrapper fields so
//! they can be read straight out of a region buffer. This macro generates the
//! native-integer getter and setter for each field.
//!
//! ```ignore
//! use zerocopy::little_endian::U16;
//!
//! #[repr(C)]
//! struct RegionHeader {
//!     region_id: U16,
//!     first_free: U16,
//! }
//!
//! impl RegionHeader {
//!     zerocopy_accessors! {
//!         region_id: u16,
//!         first_free: u16,
//!     }
//! }
//!
//! // header.first_free() -> u16
//! // header.set_first_free(0x0008)
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}

pub(crate) use zerocopy_accessors;
