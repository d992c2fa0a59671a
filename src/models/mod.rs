mod credentials;
mod dataset;
mod filter_list;
mod site;

pub use credentials::Credentials;
pub use dataset::DatasetRecord;
pub use filter_list::{FilterListRecord, NewFilterList};
pub use site::Site;
