// kernel/src/repl.rs

use alloc::string::String;
use crate::framebuffer::{FRAMEBUFFER, Color};

pub struct Repl {
    command_buffer: String,
    x: usize,
    y: usize,
    prompt: &'static str,
}

impl Repl {
    pub fn new(x: usize, y: usize) -> Self {
        Self {
            command_buffer: String::new(),
            x,
            y,
            prompt: "> ",
        }
    }

    pub fn handle_char(&mut self, c: char) {
        match c {
            '\n' => {
                self.newline();
                self.execute_command();
                self.show_prompt();
            }
            '\u{08}' => { // Backspace
                if !self.command_buffer.is_empty() {
                    self.command_buffer.pop();
                    self.redraw_line();
                }
            }
            _ => {
                self.command_buffer.push(c);
                self.draw_char(c);
            }
        }
    }

    fn execute_command(&mut self) {
        let cmd = self.command_buffer.clone();
        let cmd = cmd.trim();
        
        match cmd {
            "alloc" => self.cmd_alloc_test(),
            "help" => self.cmd_help(),
            "clear" => self.cmd_clear(),
            "heap" => self.cmd_heap(),
            "paging" => self.cmd_paging(),
            "panic" => panic!("User requested panic"),
            "" => {}, // Enter vacío
            _ if cmd.starts_with("echo ") => {
                let text = &cmd[5..];
                self.println(text);
            }
            _ => {
                self.println("Unknown command. Type 'help' for list.");
            }
        }
        
        self.command_buffer.clear();
    }

    fn cmd_alloc_test(&mut self) {
        use alloc::vec::Vec;

        let mut big_vec: Vec<u8> = Vec::new();

        for i in 0..200_000 {
            big_vec.push((i % 256) as u8);

            if i % 50_000 == 0 {
                let free = crate::allocator::buddy_allocator::BUDDY.lock().count_total_free();
                self.println(&alloc::format!(
                    "Allocated {}KB, buddy free: {} pages",
                    i / 1024,
                    free
                ));
            }
        }

        self.println("Success! Allocated 200KB");
    }

    fn cmd_help(&mut self) {
        self.println("Available commands:");
        self.println("  alloc  - Test dynamic allocation");
        self.println("  help  - Show this message");
        self.println("  clear - Clear screen");
        self.println("  heap  - Show heap stats");
        self.println("  paging - Show page mappings");
        self.println("  echo <text> - Print text");
        self.println("  panic - Test panic handler");
    }

    fn cmd_clear(&mut self) {
        let mut fb = FRAMEBUFFER.lock();
        if let Some(fb) = fb.as_mut() {
            fb.clear(Color::rgb(0, 0, 0));
        }
        self.x = 10;
        self.y = 10;
    }

    fn cmd_heap(&mut self) {
        let free = crate::allocator::buddy_allocator::BUDDY.lock().count_total_free();
        self.println(&alloc::format!("Buddy: {} pages free", free));
    }

    // fn cmd_memory(&mut self) {
    //     use bootloader_api::info::MemoryRegionKind;
        
    //     // Necesitas pasar boot_info.memory_regions de alguna forma
    //     // Por ahora, asumamos que lo guardaste globalmente
        
    //     self.println("Memory Map:");
        
    //     for (i, region) in boot_info.memory_regions.iter().enumerate() {
    //         let kind = match region.kind {
    //             MemoryRegionKind::Usable => "Usable",
    //             MemoryRegionKind::Bootloader => "Bootloader",
    //             MemoryRegionKind::UnknownBios(_) => "BIOS",
    //             MemoryRegionKind::UnknownUefi(_) => "UEFI",
    //             _ => "Other",
    //         };
            
    //         let size_kb = (region.end - region.start) / 1024;
            
    //         self.println(&alloc::format!(
    //             "  {}: {:#x}-{:#x} ({} KB) - {}",
    //             i, region.start, region.end, size_kb, kind
    //         ));
    //     }
    // }

    fn cmd_paging(&mut self) {
        use x86_64::VirtAddr;
        use crate::memory::address_space::kernel_pml4;
        use crate::memory::paging::{lookup, Lookup};

        let pml4 = kernel_pml4();
        let addrs = [0x1000u64, crate::memory::physical_memory_offset().as_u64(), 0xb8000];

        for &addr in &addrs {
            let virt = VirtAddr::new(addr);
            match lookup(pml4, virt) {
                Ok(Lookup::Present { frame, .. }) => {
                    self.println(&alloc::format!(
                        "V:{:#x} -> frame {:#x}", addr, frame
                    ));
                }
                Ok(_) => self.println(&alloc::format!("V:{:#x} -> not present", addr)),
                Err(_) => self.println(&alloc::format!("V:{:#x} -> walk error", addr)),
            }
        }
    }

    fn println(&mut self, text: &str) {
        {
            let mut fb = FRAMEBUFFER.lock();
            if let Some(fb) = fb.as_mut() {
                fb.draw_text(self.x, self.y, text, 
                    Color::rgb(255, 255, 255), Color::rgb(0, 0, 0), 2);
            }
        }
        self.newline();
    }

    fn draw_char(&mut self, c: char) {
        let mut fb = FRAMEBUFFER.lock();
        if let Some(fb) = fb.as_mut() {
            let mut buf = [0u8; 4];
            let s = c.encode_utf8(&mut buf);
            fb.draw_text(self.x, self.y, s,
                Color::rgb(255, 255, 255), Color::rgb(0, 0, 0), 2);
            self.x += 16; // 8 * scale(2)
        }
    }

    pub fn show_prompt(&mut self) {
        let mut fb = FRAMEBUFFER.lock();
        if let Some(fb) = fb.as_mut() {
            fb.draw_text(self.x, self.y, self.prompt,
                Color::rgb(0, 255, 0), Color::rgb(0, 0, 0), 2);
            self.x += 16 * self.prompt.len();
        }
    }

    fn newline(&mut self) {
        self.x = 10;
        self.y += 20;
        
        // Scroll si llegamos al final
        let mut fb = FRAMEBUFFER.lock();
        if let Some(fb) = fb.as_mut() {
            let (_, height) = fb.dimensions();
            if self.y + 20 > height {
                self.y = height - 40;
                // TODO: Scroll real
            }
        }
    }

    // Helper que no toma &mut self
    fn draw_text_at(x: usize, y: usize, text: &str, fg: Color, bg: Color) {
        let mut fb = FRAMEBUFFER.lock();
        if let Some(fb) = fb.as_mut() {
            fb.draw_text(x, y, text, fg, bg, 2);
        }
    }
    
    fn redraw_line(&mut self) {
        // Limpiar
        Self::draw_text_at(10, self.y, &" ".repeat(50), 
            Color::rgb(0, 0, 0), Color::rgb(0, 0, 0));
        
        // Prompt
        self.x = 10;
        Self::draw_text_at(self.x, self.y, self.prompt,
            Color::rgb(0, 255, 0), Color::rgb(0, 0, 0));
        self.x += 16 * self.prompt.len();
        
        // Comando
        Self::draw_text_at(self.x, self.y, &self.command_buffer,
            Color::rgb(255, 255, 255), Color::rgb(0, 0, 0));
    }
}