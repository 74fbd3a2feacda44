use std::{
    fs::File,
    io::{self, Write},
};

use machvm::{protect, read, write, ImageLocator, Pid, ProcessInfo, Task, VirtualMemoryProtect};

use super::{
    cmd::{
        CommandEnum, SubCommandImage, SubCommandMainBinary, SubCommandProtect, SubCommandRead, SubCommandRegions,
        SubCommandSelf, SubCommandSlide, SubCommandTask, SubCommandWrite,
    },
    error::Result,
    utils::{hexdump, protection_spans},
};

fn open(pid: Option<Pid>) -> Result<Task> {
    match pid {
        Some(pid) => Ok(Task::for_pid(pid)?),
        None => Ok(Task::current()),
    }
}

impl CommandEnum {
    pub fn init(self) -> Result<()> {
        match self {
            CommandEnum::TaskSelf(this) => this.init(),
            CommandEnum::Task(this) => this.init(),
            CommandEnum::Regions(this) => this.init(),
            CommandEnum::Read(this) => this.init(),
            CommandEnum::Write(this) => this.init(),
            CommandEnum::Protect(this) => this.init(),
            CommandEnum::MainBinary(this) => this.init(),
            CommandEnum::Image(this) => this.init(),
            CommandEnum::Slide(this) => this.init(),
        }
    }
}

impl SubCommandSelf {
    pub fn init(self) -> Result<()> {
        let task = Task::current();
        println!("pid {} task {:#x}", task.pid(), task.port());
        Ok(())
    }
}

impl SubCommandTask {
    pub fn init(self) -> Result<()> {
        let task = Task::for_pid(self.pid)?;
        println!("pid {} task {:#x}", task.pid(), task.port());
        Ok(())
    }
}

impl SubCommandRegions {
    pub fn init(self) -> Result<()> {
        let task = open(self.pid)?;
        let mut out = io::stdout().lock();
        for region in task.get_maps() {
            let region = region?;
            writeln!(out, "{:#x}-{:#x} {} tag={}", region.base, region.end(), region.protection, region.user_tag)?;
        }
        Ok(())
    }
}

impl SubCommandRead {
    pub fn init(self) -> Result<()> {
        let task = open(self.pid)?;
        let bytes = read(&task, self.address.0, self.size.0)?;
        match self.out {
            Some(path) => File::create(path)?.write_all(&bytes)?,
            None => hexdump(io::stdout().lock(), self.address.0, &bytes)?,
        }
        Ok(())
    }
}

impl SubCommandWrite {
    pub fn init(self) -> Result<()> {
        let task = open(self.pid)?;
        let address = self.address.0;
        let data = self.data.0;

        let Some(prot) = self.prot else {
            return Ok(write(&task, address, &data)?);
        };

        let size = data.len() as u64;
        let spans = protection_spans(task.get_maps(), address, size)?;
        protect(&task, address, size, prot)?;
        let written = write(&task, address, &data);
        for (start, len, original) in spans {
            log::debug!("restoring protection {original} at {start:#x}");
            task.protect(start, len, original)?;
        }
        Ok(written?)
    }
}

impl SubCommandProtect {
    pub fn init(self) -> Result<()> {
        let task = open(self.pid)?;
        protect(&task, self.address.0, self.size.0, self.prot)?;
        Ok(())
    }
}

impl SubCommandMainBinary {
    pub fn init(self) -> Result<()> {
        let task = open(self.pid)?;
        let address = ImageLocator::new(&task).find_main_binary()?;
        println!("{address:#x}");
        Ok(())
    }
}

impl SubCommandImage {
    pub fn init(self) -> Result<()> {
        let task = open(self.pid)?;
        let locator = ImageLocator::new(&task);
        let address = match self.address {
            Some(address) => address.0,
            None => locator.find_main_binary()?,
        };
        let image = locator.image(address)?;
        println!("base           {:#x}", image.base);
        println!("size           {:#x}", image.size);
        println!("preferred base {:#x}", image.preferred_base);
        println!("slide          {:#x}", image.slide());
        Ok(())
    }
}

impl SubCommandSlide {
    pub fn init(self) -> Result<()> {
        let task = open(self.pid)?;
        let image = ImageLocator::new(&task).main_image()?;
        println!("{:#x}", image.slide());
        Ok(())
    }
}
