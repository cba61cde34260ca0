//! Boxed types with more than one constructor.

use crate::deserialize::{self, Buffer, Error};
use crate::{Deserializable, Identifiable, Serializable, types};

/// Implements `Serializable`, `Deserializable` and `From<variant>` for an
/// enum whose variants each wrap one boxed constructor.
macro_rules! tl_enum {
    ($(#[$meta:meta])* $name:ident { $( $variant:ident($ty:ty) ),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq)]
        pub enum $name {
            $( $variant($ty), )+
        }

        impl Serializable for $name {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                match self {
                    $( Self::$variant(x) => x.serialize(buf), )+
                }
            }
        }

        impl Deserializable for $name {
            fn deserialize(buf: Buffer) -> deserialize::Result<Self> {
                let id = buf.peek_u32()?;
                $(
                    if id == <$ty as Identifiable>::CONSTRUCTOR_ID {
                        return Ok(Self::$variant(<$ty>::deserialize(buf)?));
                    }
                )+
                Err(Error::UnexpectedConstructor { id })
            }
        }

        $(
            impl From<$ty> for $name {
                fn from(x: $ty) -> Self { Self::$variant(x) }
            }
        )+
    };
}

tl_enum! {
    /// `Server_DH_Params`
    ServerDhParams {
        Ok(types::ServerDhParamsOk),
        Fail(types::ServerDhParamsFail),
    }
}

tl_enum! {
    /// `Set_client_DH_params_answer`
    SetClientDhParamsAnswer {
        DhGenOk(types::DhGenOk),
        DhGenRetry(types::DhGenRetry),
        DhGenFail(types::DhGenFail),
    }
}

tl_enum! {
    DestroySessionRes {
        Ok(types::DestroySessionOk),
        None(types::DestroySessionNone),
    }
}

tl_enum! {
    InputFile {
        File(types::InputFile),
        Big(types::InputFileBig),
    }
}

pub mod upload {
    use super::*;
    use crate::types::upload as t;

    tl_enum! {
        /// `upload.File`: either the chunk or a CDN redirect.
        File {
            File(t::File),
            CdnRedirect(t::FileCdnRedirect),
        }
    }

    tl_enum! {
        /// `upload.CdnFile`
        CdnFile {
            File(t::CdnFile),
            ReuploadNeeded(t::CdnFileReuploadNeeded),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatches_on_constructor() {
        let ok = types::DhGenRetry {
            nonce: [1; 16],
            server_nonce: [2; 16],
            new_nonce_hash2: [3; 16],
        };
        let bytes = ok.to_bytes();
        match SetClientDhParamsAnswer::from_bytes(&bytes).unwrap() {
            SetClientDhParamsAnswer::DhGenRetry(r) => assert_eq!(r, ok),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_constructor() {
        let bytes = 0x11223344u32.to_bytes();
        assert_eq!(
            ServerDhParams::from_bytes(&bytes),
            Err(Error::UnexpectedConstructor { id: 0x11223344 })
        );
    }
}
