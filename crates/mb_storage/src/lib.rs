#![forbid(unsafe_code)]

pub mod backend;
pub mod cookie;
pub mod extension;
pub mod memory;
pub mod page;
pub mod stamped;

pub use backend::{KeyValueBackend, StorageError, StorageMedium};
pub use cookie::{CookieJar, SameSite, SetCookie};
pub use extension::ExtensionStorage;
pub use memory::MemoryBackend;
pub use page::{BrowserProfile, PageStorage};
pub use stamped::{read_stamped, write_stamped, Stamped};
