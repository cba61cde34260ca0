// Declarative stand-ins for schema codegen. Only plain constructors (no
// flags, no generics) go through these; everything else is written by hand.

/// A boxed constructor: serializes with its ID, deserializes after checking it.
///
/// `deserialize_bare` reads the fields only, for bare occurrences such as the
/// elements of a `vector<future_salt>`.
macro_rules! tl_type {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal { $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field: $ty, )*
        }

        impl $crate::Identifiable for $name {
            const CONSTRUCTOR_ID: u32 = $id;
        }

        impl $crate::Serializable for $name {
            #[allow(unused_variables)]
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                $crate::Serializable::serialize(&<Self as $crate::Identifiable>::CONSTRUCTOR_ID, buf);
                $( $crate::Serializable::serialize(&self.$field, buf); )*
            }
        }

        impl $name {
            /// Read the fields without a leading constructor ID.
            #[allow(unused_variables)]
            pub fn deserialize_bare(
                buf: $crate::deserialize::Buffer,
            ) -> $crate::deserialize::Result<Self> {
                Ok(Self {
                    $( $field: <$ty as $crate::Deserializable>::deserialize(buf)?, )*
                })
            }
        }

        impl $crate::Deserializable for $name {
            fn deserialize(buf: $crate::deserialize::Buffer) -> $crate::deserialize::Result<Self> {
                $crate::deserialize::expect_id(buf, <Self as $crate::Identifiable>::CONSTRUCTOR_ID)?;
                Self::deserialize_bare(buf)
            }
        }
    };
}

/// An RPC function: a [`tl_type!`] plus its `RemoteCall::Return`.
macro_rules! tl_function {
    (
        $(#[$meta:meta])*
        $name:ident = $id:literal { $( $(#[$fmeta:meta])* $field:ident : $ty:ty ),* $(,)? } -> $ret:ty
    ) => {
        tl_type! {
            $(#[$meta])*
            $name = $id { $( $(#[$fmeta])* $field : $ty ),* }
        }

        impl $crate::RemoteCall for $name {
            type Return = $ret;
        }
    };
}
