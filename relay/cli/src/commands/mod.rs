mod camd35;
mod cccam;
mod readers;

pub use self::camd35::Camd35Command;
pub use self::cccam::CccamCommand;
pub use self::readers::ReadersCommand;
